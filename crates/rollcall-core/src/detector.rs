//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes RGB camera frames to 640×640, decodes the three anchor-free
//! stride levels and applies NMS. Detections come back sorted by confidence.

use crate::types::{BoundingBox, RgbView};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Default detection confidence used by the attendance deployment.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.35;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download it from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can find faces in an RGB image.
///
/// `max_faces == 0` means no limit. Results are ordered by descending confidence.
pub trait DetectFaces: Send {
    fn detect_faces(
        &mut self,
        image: RgbView<'_>,
        max_faces: usize,
    ) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    confidence_threshold: f32,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model; detections at or below `confidence_threshold` are dropped.
    pub fn load(model_path: &str, confidence_threshold: f32) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::info!(
            path = model_path,
            confidence_threshold,
            outputs = ?output_names,
            ?stride_indices,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            confidence_threshold,
            stride_indices,
        })
    }

    /// Detect faces in an RGB frame, returning bounding boxes sorted by confidence.
    pub fn detect(&mut self, image: RgbView<'_>) -> Result<Vec<BoundingBox>, DetectorError> {
        if !image.is_complete() {
            return Err(DetectorError::InvalidFrame(format!(
                "{}x{} frame with {} bytes",
                image.width,
                image.height,
                image.data.len()
            )));
        }

        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            all_detections.extend(decode_stride(
                StrideOutputs { scores, bboxes, kps },
                stride,
                &letterbox,
                self.confidence_threshold,
            ));
        }

        Ok(nms(all_detections, SCRFD_NMS_THRESHOLD))
    }
}

impl DetectFaces for FaceDetector {
    fn detect_faces(
        &mut self,
        image: RgbView<'_>,
        max_faces: usize,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let mut faces = self.detect(image)?;
        if max_faces > 0 {
            faces.truncate(max_faces);
        }
        Ok(faces)
    }
}

/// Letterbox an RGB frame into a 1×3×640×640 tensor normalised for SCRFD.
///
/// Pad pixels take the mean value so they normalise to 0.0.
fn preprocess(image: RgbView<'_>) -> (Array4<f32>, LetterboxInfo) {
    let width = image.width as usize;
    let height = image.height as usize;
    let scale = (SCRFD_INPUT_SIZE as f32 / width as f32).min(SCRFD_INPUT_SIZE as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as usize).min(SCRFD_INPUT_SIZE);
    let new_h = ((height as f32 * scale).round() as usize).min(SCRFD_INPUT_SIZE);
    let pad_x = (SCRFD_INPUT_SIZE - new_w) as f32 / 2.0;
    let pad_y = (SCRFD_INPUT_SIZE - new_h) as f32 / 2.0;
    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;

    let zero = (SCRFD_MEAN - SCRFD_MEAN) / SCRFD_STD;
    let mut tensor = Array4::<f32>::from_elem((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE), zero);

    // Bilinear resample straight into the padded tensor.
    let inv_scale = 1.0 / scale;
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let (tl, tr) = (image.pixel(x0, y0), image.pixel(x1, y0));
            let (bl, br) = (image.pixel(x0, y1), image.pixel(x1, y1));

            for c in 0..3 {
                let val = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                    + tr[c] as f32 * fx * (1.0 - fy)
                    + bl[c] as f32 * (1.0 - fx) * fy
                    + br[c] as f32 * fx * fy;
                tensor[[0, c, y + pad_y_start, x + pad_x_start]] = (val - SCRFD_MEAN) / SCRFD_STD;
            }
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Discover output tensor ordering by name.
///
/// Exports either name tensors "score_8", "bbox_16", "kps_32", ... or use
/// numeric names, in which case the standard positional layout applies:
/// [0-2] scores, [3-5] bboxes, [6-8] kps, each for strides 8/16/32.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(indices) => {
            tracing::debug!("SCRFD: using name-based output tensor mapping");
            [indices[0], indices[1], indices[2]]
        }
        None => {
            tracing::debug!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Raw output tensors for one stride level.
struct StrideOutputs<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// Decode detections for a single stride level into original-frame coordinates.
fn decode_stride(
    out: StrideOutputs<'_>,
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;
    let unbox = |x: f32, y: f32| ((x - letterbox.pad_x) / letterbox.scale, (y - letterbox.pad_y) / letterbox.scale);

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = out.scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let bbox_off = idx * 4;
        let Some(d) = out.bboxes.get(bbox_off..bbox_off + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid) as f32 * step;
        let anchor_y = (cell / grid) as f32 * step;

        let (x1, y1) = unbox(anchor_x - d[0] * step, anchor_y - d[1] * step);
        let (x2, y2) = unbox(anchor_x + d[2] * step, anchor_y + d[3] * step);

        let kps_off = idx * 10;
        let landmarks = out.kps.get(kps_off..kps_off + 10).map(|k| {
            std::array::from_fn(|i| unbox(anchor_x + k[i * 2] * step, anchor_y + k[i * 2 + 1] * step))
        });

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Non-Maximum Suppression; output is sorted by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let (ax1, ay1, ax2, ay2) = a.corners();
    let (bx1, by1, bx2, by2) = b.corners();

    let inter = (ax2.min(bx2) - ax1.max(bx1)).max(0.0) * (ay2.min(by2) - ay1.max(by1)).max(0.0);
    let union = a.area() + b.area() - inter;

    if union > 0.0 { inter / union } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf, landmarks: None }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping_and_sorts() {
        let detections = vec![
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_preprocess_letterbox_padding() {
        // 320x160 → scale 2.0, content 640x320, 160px bands above and below.
        let data = vec![255u8; 320 * 160 * 3];
        let (tensor, lb) = preprocess(RgbView::new(&data, 320, 160));
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert!((lb.pad_y - 160.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 2, 320, 320]] - inside).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        let mut data = Vec::new();
        for _ in 0..(64 * 64) {
            data.extend_from_slice(&[255, 0, 128]);
        }
        let (tensor, _) = preprocess(RgbView::new(&data, 64, 64));
        assert!(tensor[[0, 0, 300, 300]] > 0.9);
        assert!(tensor[[0, 1, 300, 300]] < -0.9);
        assert!(tensor[[0, 2, 300, 300]].abs() < 0.01);
    }

    #[test]
    fn test_decode_stride_maps_back_to_frame() {
        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 160.0 };
        let grid = SCRFD_INPUT_SIZE / 32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let bboxes = vec![1.0f32; anchors * 4];
        let kps = vec![0.0f32; anchors * 10];
        // Cell (x=10, y=10) → anchor centre (320, 320) in letterbox space.
        let idx = (10 * grid + 10) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;

        let dets = decode_stride(
            StrideOutputs { scores: &scores, bboxes: &bboxes, kps: &kps },
            32,
            &letterbox,
            0.5,
        );
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        // (320 - 32) / 2 = 144, (320 - 32 - 160) / 2 = 64, size 64 / 2 = 32
        assert!((d.x - 144.0).abs() < 1e-4);
        assert!((d.y - 64.0).abs() < 1e-4);
        assert!((d.width - 32.0).abs() < 1e-4);
        let lms = d.landmarks.expect("landmarks decoded");
        assert!((lms[2].0 - 160.0).abs() < 1e-4);
        assert!((lms[2].1 - 80.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_threshold_is_exclusive() {
        let letterbox = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let scores = vec![0.35f32; 4];
        let bboxes = vec![1.0f32; 16];
        let dets = decode_stride(StrideOutputs { scores: &scores, bboxes: &bboxes, kps: &[] }, 32, &letterbox, 0.35);
        assert!(dets.is_empty());
    }

    #[test]
    fn test_discover_output_indices_named_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (428..437).map(|i| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }
}
