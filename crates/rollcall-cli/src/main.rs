use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rollcall_hw::Camera;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn take_attendance(&self, camera_id: i64, course_id: i64, date: &str) -> zbus::Result<(bool, String)>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_schedules(&self) -> zbus::Result<String>;
    async fn list_expired(&self) -> zbus::Result<String>;
    async fn add_schedule(&self, camera_id: i64, course_id: i64, date: &str, time: &str) -> zbus::Result<i64>;
    async fn remove_schedule(&self, id: i64) -> zbus::Result<bool>;
    async fn attendance(&self, course_id: i64, date: &str) -> zbus::Result<String>;
    async fn set_attendance(&self, student_id: i64, date: &str, status: &str) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall classroom attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take attendance now
    Take {
        #[arg(long)]
        camera: i64,
        #[arg(long)]
        course: i64,
        /// Attendance date (YYYY-MM-DD); today if omitted
        #[arg(long)]
        date: Option<String>,
    },
    /// Show daemon status
    Status,
    /// List or edit pending schedule entries
    Schedules {
        /// Show archived entries that expired without a successful capture
        #[arg(long)]
        expired: bool,

        #[command(subcommand)]
        action: Option<ScheduleAction>,
    },
    /// Show a course's attendance for a day
    Attendance {
        #[arg(long)]
        course: i64,
        /// Date (YYYY-MM-DD); today if omitted
        #[arg(long)]
        date: Option<String>,
    },
    /// Manually set a student's status
    Mark {
        #[arg(long)]
        student: i64,
        #[arg(long, value_enum)]
        status: Status,
        /// Date (YYYY-MM-DD)
        #[arg(long)]
        date: String,
    },
    /// List local V4L2 capture devices
    Devices,
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Schedule a capture
    Add {
        #[arg(long)]
        camera: i64,
        #[arg(long)]
        course: i64,
        /// YYYY-MM-DD
        #[arg(long)]
        date: String,
        /// HH:MM or HH:MM:SS
        #[arg(long)]
        time: String,
    },
    /// Remove a pending entry
    Remove { id: i64 },
}

#[derive(Clone, Copy, ValueEnum)]
enum Status {
    Present,
    Absent,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Present => "Present",
            Status::Absent => "Absent",
        }
    }
}

async fn connect(session: bool) -> Result<AttendanceProxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        let devices = Camera::list_devices();
        if devices.is_empty() {
            println!("No capture devices found");
        }
        for d in devices {
            println!("{}\t{}\t{} ({})", d.path, d.name, d.driver, d.bus);
        }
        return Ok(());
    }

    let proxy = connect(cli.session).await?;
    tracing::debug!(session_bus = cli.session, "connected to rollcalld");

    match cli.command {
        Commands::Take { camera, course, date } => {
            let (success, message) = proxy
                .take_attendance(camera, course, date.as_deref().unwrap_or(""))
                .await?;
            if !success {
                bail!("{message}");
            }
            println!("{message}");
        }
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Schedules { expired, action } => match action {
            None if expired => print_json(&proxy.list_expired().await?)?,
            None => print_json(&proxy.list_schedules().await?)?,
            Some(ScheduleAction::Add {
                camera,
                course,
                date,
                time,
            }) => {
                let id = proxy.add_schedule(camera, course, &date, &time).await?;
                println!("Scheduled entry {id}");
            }
            Some(ScheduleAction::Remove { id }) => {
                if !proxy.remove_schedule(id).await? {
                    bail!("no pending schedule entry {id}");
                }
                println!("Removed entry {id}");
            }
        },
        Commands::Attendance { course, date } => {
            print_json(&proxy.attendance(course, date.as_deref().unwrap_or("")).await?)?
        }
        Commands::Mark { student, status, date } => {
            proxy.set_attendance(student, &date, status.as_str()).await?;
            println!("Student {student} marked {} on {date}", status.as_str());
        }
        Commands::Devices => {}
    }

    Ok(())
}
