//! Face alignment to the canonical ArcFace crop.
//!
//! Fits a 4-DOF similarity transform (scale, rotation, translation) from the
//! five detected landmarks onto the InsightFace reference positions and warps
//! the face into a 112×112 luma crop.

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Similarity transform `dst = [a -b; b a] * src + [tx; ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit over point pairs, in closed form on centered coordinates.
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(x, y), p| (x + p.0, y + p.1));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let mut num_a = 0.0f32;
        let mut num_b = 0.0f32;
        let mut denom = 0.0f32;
        for (s, d) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (s.0 - msx, s.1 - msy);
            let (dx, dy) = (d.0 - mdx, d.1 - mdy);
            num_a += sx * dx + sy * dy;
            num_b += sx * dy - sy * dx;
            denom += sx * sx + sy * sy;
        }

        if denom < 1e-12 {
            // Degenerate landmarks (all coincident): translate only.
            return Self { a: 1.0, b: 0.0, tx: mdx - msx, ty: mdy - msy };
        }

        let a = num_a / denom;
        let b = num_b / denom;
        Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        }
    }

    /// Map an output (destination) pixel back into the source frame.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some((
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        ))
    }
}

/// Bilinear sample with black outside the frame.
fn sample(frame: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let px = |xi: f32, yi: f32| -> f32 {
        if xi < 0.0 || yi < 0.0 || xi >= width as f32 || yi >= height as f32 {
            return 0.0;
        }
        frame
            .get(yi as usize * width + xi as usize)
            .copied()
            .unwrap_or(0) as f32
    };

    px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x0 + 1.0, y0) * fx * (1.0 - fy)
        + px(x0, y0 + 1.0) * (1.0 - fx) * fy
        + px(x0 + 1.0, y0 + 1.0) * fx * fy
}

fn warp(frame: &[u8], width: usize, height: usize, transform: &Similarity, out_size: usize) -> Vec<u8> {
    let mut output = vec![0u8; out_size * out_size];
    for oy in 0..out_size {
        for ox in 0..out_size {
            if let Some((sx, sy)) = transform.invert_point(ox as f32, oy as f32) {
                output[oy * out_size + ox] =
                    sample(frame, width, height, sx, sy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    output
}

/// Align a detected face to a canonical 112×112 crop suitable for ArcFace.
pub fn align_face(frame: &[u8], width: u32, height: u32, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let transform = Similarity::fit(landmarks, &REFERENCE_LANDMARKS_112);
    warp(frame, width as usize, height as usize, &transform, ALIGNED_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_identity() {
        let t = Similarity::fit(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112);
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3, "t = ({}, {})", t.tx, t.ty);
    }

    #[test]
    fn test_fit_double_scale() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0 + 10.0, y * 2.0 - 4.0));
        let t = Similarity::fit(&src, &REFERENCE_LANDMARKS_112);
        assert!((t.a - 0.5).abs() < 1e-3, "a = {}", t.a);
        assert!(t.b.abs() < 1e-3, "b = {}", t.b);
        let (x, y) = t.invert_point(REFERENCE_LANDMARKS_112[2].0, REFERENCE_LANDMARKS_112[2].1).unwrap();
        assert!((x - src[2].0).abs() < 1e-2 && (y - src[2].1).abs() < 1e-2);
    }

    #[test]
    fn test_fit_degenerate_landmarks() {
        let src = [(5.0, 5.0); 5];
        let t = Similarity::fit(&src, &REFERENCE_LANDMARKS_112);
        assert_eq!(t.a, 1.0);
        assert_eq!(t.b, 0.0);
    }

    #[test]
    fn test_align_output_size() {
        let frame = vec![128u8; 640 * 480];
        let aligned = align_face(&frame, 640, 480, &REFERENCE_LANDMARKS_112);
        assert_eq!(aligned.len(), ALIGNED_SIZE * ALIGNED_SIZE);
        // Interior of a uniform frame stays uniform.
        assert_eq!(aligned[56 * ALIGNED_SIZE + 56], 128);
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let (w, h) = (200usize, 200usize);
        let mut frame = vec![0u8; w * h];
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for y in 58..63 {
            for x in 78..83 {
                frame[y * w + x] = 255;
            }
        }

        let aligned = align_face(&frame, w as u32, h as u32, &src);
        let rx = REFERENCE_LANDMARKS_112[0].0.round() as usize;
        let ry = REFERENCE_LANDMARKS_112[0].1.round() as usize;
        let peak = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned[y * ALIGNED_SIZE + x])
            .max()
            .unwrap_or(0);
        assert!(peak > 100, "expected bright patch near ({rx}, {ry}), peak={peak}");
    }
}
