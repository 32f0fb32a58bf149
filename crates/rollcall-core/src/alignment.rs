//! Face alignment via 4-DOF similarity transform.
//!
//! Warps a detected face in an RGB frame onto the canonical 112×112 ArcFace
//! crop using the five InsightFace reference landmarks.

use crate::types::RgbView;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Similarity transform `dst = [[a, -b], [b, a]] * src + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares estimate from five point pairs.
    ///
    /// Uses the closed form for a 2D similarity: centre both point sets, then
    /// `a = Σ(s·d) / Σ|s|²`, `b = Σ(s×d) / Σ|s|²`.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let (smx, smy) = centroid(src);
        let (dmx, dmy) = centroid(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut norm = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - smx, sy - smy);
            let (dx, dy) = (dx - dmx, dy - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }

        if norm / n < 1e-9 {
            return None;
        }

        let a = dot / norm;
        let b = cross / norm;
        Some(Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        })
    }

    /// Map an output (destination) point back into the source frame.
    fn invert_point(&self, x: f32, y: f32) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (dx, dy) = (x - self.tx, y - self.ty);
        ((self.a * dx + self.b * dy) / det, (-self.b * dx + self.a * dy) / det)
    }
}

fn centroid(pts: &[(f32, f32); 5]) -> (f32, f32) {
    let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
    (sx / pts.len() as f32, sy / pts.len() as f32)
}

/// Bilinear RGB sample; out-of-frame taps read as black.
fn sample(image: &RgbView<'_>, sx: f32, sy: f32) -> [f32; 3] {
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;
    let (w, h) = (image.width as i64, image.height as i64);

    let tap = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            image.pixel(x as usize, y as usize).map(f32::from)
        } else {
            [0.0; 3]
        }
    };

    let (tl, tr, bl, br) = (tap(x0, y0), tap(x0 + 1, y0), tap(x0, y0 + 1), tap(x0 + 1, y0 + 1));
    std::array::from_fn(|c| {
        tl[c] * (1.0 - fx) * (1.0 - fy) + tr[c] * fx * (1.0 - fy) + bl[c] * (1.0 - fx) * fy + br[c] * fx * fy
    })
}

fn warp(image: &RgbView<'_>, transform: &Similarity, out_size: usize) -> Vec<u8> {
    let mut output = vec![0u8; out_size * out_size * 3];
    for oy in 0..out_size {
        for ox in 0..out_size {
            let (sx, sy) = transform.invert_point(ox as f32, oy as f32);
            let rgb = sample(image, sx, sy);
            let base = (oy * out_size + ox) * 3;
            for c in 0..3 {
                output[base + c] = rgb[c].round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    output
}

/// Align a detected face to a canonical 112×112 RGB crop.
///
/// Degenerate landmarks (all points coincident) yield a black crop.
pub fn align_face(image: RgbView<'_>, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    match Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112) {
        Some(t) => warp(&image, &t, ALIGNED_SIZE),
        None => vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE * 3],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let t = Similarity::estimate(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_scaled_transform() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 0.5).abs() < 1e-3, "a = {}", t.a);
    }

    #[test]
    fn test_rotated_transform_roundtrip() {
        // 90° rotation about the origin: (x, y) → (-y, x)
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (y, -x));
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112).unwrap();
        let (bx, by) = t.invert_point(REFERENCE_LANDMARKS_112[2].0, REFERENCE_LANDMARKS_112[2].1);
        assert!((bx - src[2].0).abs() < 1e-2 && (by - src[2].1).abs() < 1e-2);
    }

    #[test]
    fn test_degenerate_landmarks() {
        assert!(Similarity::estimate(&[(5.0, 5.0); 5], &REFERENCE_LANDMARKS_112).is_none());
        let frame = vec![200u8; 32 * 32 * 3];
        let out = align_face(RgbView::new(&frame, 32, 32), &[(5.0, 5.0); 5]);
        assert!(out.iter().all(|&p| p == 0));
    }

    #[test]
    fn test_align_face_output_size() {
        let frame = vec![128u8; 640 * 480 * 3];
        let aligned = align_face(RgbView::new(&frame, 640, 480), &REFERENCE_LANDMARKS_112);
        assert_eq!(aligned.len(), ALIGNED_SIZE * ALIGNED_SIZE * 3);
        assert_eq!(aligned[(56 * ALIGNED_SIZE + 56) * 3], 128);
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let (w, h) = (200usize, 200usize);
        let mut frame = vec![0u8; w * h * 3];
        let src: [(f32, f32); 5] = [(80.0, 60.0), (120.0, 60.0), (100.0, 85.0), (85.0, 110.0), (115.0, 110.0)];

        // Red 5x5 patch on the left eye.
        let (lx, ly) = (src[0].0 as usize, src[0].1 as usize);
        for py in ly - 2..=ly + 2 {
            for px in lx - 2..=lx + 2 {
                frame[(py * w + px) * 3] = 255;
            }
        }

        let aligned = align_face(RgbView::new(&frame, w as u32, h as u32), &src);
        let (rx, ry) = (
            REFERENCE_LANDMARKS_112[0].0.round() as usize,
            REFERENCE_LANDMARKS_112[0].1.round() as usize,
        );
        let mut max_red = 0u8;
        let mut max_green = 0u8;
        for y in ry - 1..=ry + 1 {
            for x in rx - 1..=rx + 1 {
                max_red = max_red.max(aligned[(y * ALIGNED_SIZE + x) * 3]);
                max_green = max_green.max(aligned[(y * ALIGNED_SIZE + x) * 3 + 1]);
            }
        }
        assert!(max_red > 100, "expected red patch near ({rx}, {ry}), max={max_red}");
        assert_eq!(max_green, 0);
    }
}
