use std::collections::HashMap;

use ndarray::{ArrayView1, ArrayView2, ArrayViewD, Axis, Ix3, s};
use serde::Serialize;

use crate::error::{DiagnosisError, Result};
use crate::preprocess::Letterbox;

/// Number of box coordinates (cx, cy, w, h) leading each YOLOv8 prediction.
const BOX_FIELDS: usize = 4;

/// One candidate produced by a single inference call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class_index: usize,
    /// Class score in `[0, 1]`
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in original image pixels
    pub bbox: [f32; 4],
}

/// Index and value of the largest element. Ties keep the first index.
pub fn argmax_and_max(scores: &ArrayView1<f32>) -> (usize, f32) {
    scores
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(max_idx, max_val), (i, &val)| {
            if val > max_val { (i, val) } else { (max_idx, max_val) }
        })
}

/// Decodes a YOLOv8 detection head into thresholded candidates.
///
/// The export emits `[1, 4 + num_classes, anchors]`; some toolchains emit the
/// transpose `[1, anchors, 4 + num_classes]`, which is accepted as well. Any
/// other shape is reported as an inference failure.
pub fn decode_yolo_output(
    output: &ArrayViewD<f32>,
    num_classes: usize,
    threshold: f32,
    letterbox: &Letterbox,
) -> Result<Vec<Detection>> {
    let output = output
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|_| DiagnosisError::Inference(format!("unexpected output shape {:?}", output.shape())))?;
    if output.shape()[0] != 1 {
        return Err(DiagnosisError::Inference(format!(
            "expected a single image in the output batch, got {}",
            output.shape()[0]
        )));
    }

    let rows = BOX_FIELDS + num_classes;
    let batch = output.index_axis_move(Axis(0), 0);
    // (rows, anchors)
    let preds: ArrayView2<f32> = if batch.shape()[0] == rows {
        batch
    } else if batch.shape()[1] == rows {
        batch.reversed_axes()
    } else {
        return Err(DiagnosisError::Inference(format!(
            "output shape [1, {}, {}] does not match {} classes",
            batch.shape()[0],
            batch.shape()[1],
            num_classes
        )));
    };

    let mut detections = Vec::new();
    for anchor in preds.axis_iter(Axis(1)) {
        let scores = anchor.slice(s![BOX_FIELDS..]);
        let (class_index, confidence) = argmax_and_max(&scores);
        if confidence >= threshold {
            detections.push(Detection {
                class_index,
                confidence,
                bbox: letterbox.to_original(anchor[0], anchor[1], anchor[2], anchor[3]),
            });
        }
    }
    Ok(detections)
}

/// Intersection over Union of two `[x1, y1, x2, y2]` boxes.
pub fn compute_iou(b1: &[f32; 4], b2: &[f32; 4]) -> f32 {
    let [x1_1, y1_1, x2_1, y2_1] = *b1;
    let [x1_2, y1_2, x2_2, y2_2] = *b2;

    let inter_x1 = x1_1.max(x1_2);
    let inter_y1 = y1_1.max(y1_2);
    let inter_x2 = x2_1.min(x2_2);
    let inter_y2 = y2_1.min(y2_2);

    let inter_area = ((inter_x2 - inter_x1).max(0.0)) * ((inter_y2 - inter_y1).max(0.0));
    let area1 = (x2_1 - x1_1).max(0.0) * (y2_1 - y1_1).max(0.0);
    let area2 = (x2_2 - x1_2).max(0.0) * (y2_2 - y1_2).max(0.0);
    let union_area = area1 + area2 - inter_area;
    if union_area <= 0.0 { 0.0 } else { inter_area / union_area }
}

/// Class-aware greedy NMS.
///
/// Returns survivors sorted by descending confidence; equal confidences keep
/// their original relative order.
pub fn non_maximum_suppression(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    // Group indices by class id.
    let mut by_class: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, det) in detections.iter().enumerate() {
        by_class.entry(det.class_index).or_default().push(i);
    }

    let mut keep_indices: Vec<usize> = Vec::new();
    for indices in by_class.values_mut() {
        indices.sort_by(|&i1, &i2| detections[i2].confidence.total_cmp(&detections[i1].confidence));

        let mut suppressed = vec![false; indices.len()];
        for i in 0..indices.len() {
            if suppressed[i] {
                continue;
            }
            let idx_i = indices[i];
            keep_indices.push(idx_i);
            for j in (i + 1)..indices.len() {
                if suppressed[j] {
                    continue;
                }
                let iou = compute_iou(&detections[idx_i].bbox, &detections[indices[j]].bbox);
                if iou > iou_threshold {
                    suppressed[j] = true;
                }
            }
        }
    }

    // Ascending index first so the stable sort below is deterministic.
    keep_indices.sort_unstable();
    keep_indices.sort_by(|&a, &b| detections[b].confidence.total_cmp(&detections[a].confidence));
    keep_indices.into_iter().map(|i| detections[i].clone()).collect()
}

/// Highest-confidence detection; the first one seen wins a tie.
pub fn top_detection(detections: &[Detection]) -> Option<&Detection> {
    detections.iter().fold(None, |best: Option<&Detection>, det| match best {
        Some(b) if det.confidence <= b.confidence => Some(b),
        _ => Some(det),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array3};

    fn identity_letterbox() -> Letterbox {
        Letterbox { scale: 1.0, x_offset: 0, y_offset: 0, orig_width: 512, orig_height: 512 }
    }

    /// Builds a `[1, 4 + nc, anchors]` head from per-anchor (box, scores).
    fn head(anchors: &[([f32; 4], Vec<f32>)]) -> Array3<f32> {
        let nc = anchors[0].1.len();
        let mut out = Array3::<f32>::zeros((1, 4 + nc, anchors.len()));
        for (a, (bx, scores)) in anchors.iter().enumerate() {
            for k in 0..4 {
                out[[0, k, a]] = bx[k];
            }
            for (c, &s) in scores.iter().enumerate() {
                out[[0, 4 + c, a]] = s;
            }
        }
        out
    }

    fn det(class_index: usize, confidence: f32, bbox: [f32; 4]) -> Detection {
        Detection { class_index, confidence, bbox }
    }

    #[test]
    fn argmax_prefers_first_of_equal_scores() {
        let scores = Array1::from(vec![0.2, 0.7, 0.7, 0.1]);
        assert_eq!(argmax_and_max(&scores.view()), (1, 0.7));
    }

    #[test]
    fn decode_keeps_candidates_at_or_above_threshold() {
        let out = head(&[
            ([100.0, 100.0, 20.0, 20.0], vec![0.10, 0.80]),
            ([200.0, 200.0, 40.0, 40.0], vec![0.25, 0.05]),
            ([300.0, 300.0, 10.0, 10.0], vec![0.24, 0.01]),
        ]);
        let dets = decode_yolo_output(&out.view().into_dyn(), 2, 0.25, &identity_letterbox()).unwrap();

        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].class_index, 1);
        assert_eq!(dets[0].bbox, [90.0, 90.0, 110.0, 110.0]);
        assert_eq!(dets[1].class_index, 0);
        assert_eq!(dets[1].confidence, 0.25);
    }

    #[test]
    fn decode_accepts_transposed_layout() {
        let out = head(&[
            ([50.0, 50.0, 10.0, 10.0], vec![0.9, 0.0, 0.0]),
            ([60.0, 60.0, 10.0, 10.0], vec![0.0, 0.0, 0.4]),
        ]);
        let transposed = out.view().permuted_axes([0, 2, 1]).to_owned();
        let dets = decode_yolo_output(&transposed.view().into_dyn(), 3, 0.3, &identity_letterbox()).unwrap();

        assert_eq!(dets.iter().map(|d| d.class_index).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn decode_rejects_mismatched_shape() {
        let out = Array3::<f32>::zeros((1, 9, 8));
        let err = decode_yolo_output(&out.view().into_dyn(), 3, 0.25, &identity_letterbox()).unwrap_err();
        assert!(matches!(err, DiagnosisError::Inference(_)));

        let flat = ndarray::Array2::<f32>::zeros((7, 8));
        let err = decode_yolo_output(&flat.view().into_dyn(), 3, 0.25, &identity_letterbox()).unwrap_err();
        assert!(matches!(err, DiagnosisError::Inference(_)));
    }

    #[test]
    fn raising_threshold_only_removes_candidates() {
        let out = head(&[
            ([10.0, 10.0, 4.0, 4.0], vec![0.15, 0.05]),
            ([20.0, 20.0, 4.0, 4.0], vec![0.30, 0.55]),
            ([30.0, 30.0, 4.0, 4.0], vec![0.65, 0.10]),
            ([40.0, 40.0, 4.0, 4.0], vec![0.02, 0.91]),
        ]);
        let thresholds = [0.0, 0.1, 0.25, 0.5, 0.6, 0.9, 1.0];
        for pair in thresholds.windows(2) {
            let low = decode_yolo_output(&out.view().into_dyn(), 2, pair[0], &identity_letterbox()).unwrap();
            let high = decode_yolo_output(&out.view().into_dyn(), 2, pair[1], &identity_letterbox()).unwrap();
            assert!(high.iter().all(|d| low.contains(d)), "t={} not a subset of t={}", pair[1], pair[0]);
        }
    }

    #[test]
    fn decode_maps_boxes_through_letterbox() {
        // 1024x512 source letterboxed into 512x512: scale 0.5, 128px vertical padding.
        let letterbox = Letterbox { scale: 0.5, x_offset: 0, y_offset: 128, orig_width: 1024, orig_height: 512 };
        let out = head(&[([256.0, 256.0, 100.0, 50.0], vec![0.9])]);
        let dets = decode_yolo_output(&out.view().into_dyn(), 1, 0.5, &letterbox).unwrap();
        assert_eq!(dets[0].bbox, [412.0, 206.0, 612.0, 306.0]);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert_eq!(compute_iou(&a, &a), 1.0);
        assert_eq!(compute_iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        assert_eq!(compute_iou(&a, &[5.0, 0.0, 15.0, 10.0]), 50.0 / 150.0);
    }

    #[test]
    fn nms_suppresses_overlaps_within_a_class_only() {
        let dets = vec![
            det(0, 0.6, [0.0, 0.0, 10.0, 10.0]),
            det(0, 0.9, [1.0, 1.0, 11.0, 11.0]),
            det(1, 0.7, [0.0, 0.0, 10.0, 10.0]),
            det(0, 0.5, [50.0, 50.0, 60.0, 60.0]),
        ];
        let kept = non_maximum_suppression(dets, 0.5);
        let summary: Vec<(usize, f32)> = kept.iter().map(|d| (d.class_index, d.confidence)).collect();
        assert_eq!(summary, vec![(0, 0.9), (1, 0.7), (0, 0.5)]);
    }

    #[test]
    fn top_detection_breaks_ties_by_first_seen() {
        let dets = vec![
            det(3, 0.4, [0.0; 4]),
            det(1, 0.8, [0.0; 4]),
            det(2, 0.8, [0.0; 4]),
        ];
        assert_eq!(top_detection(&dets).map(|d| d.class_index), Some(1));
        assert!(top_detection(&[]).is_none());
    }
}
