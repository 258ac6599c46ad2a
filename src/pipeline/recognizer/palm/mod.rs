mod anchors;

use std::{cmp::Ordering, path::Path};

use anchors::{NUM_ANCHORS, generate_anchors};
use anyhow::{Context, Result, anyhow};
use ort::session::Session;
use ort::value::Tensor;

use crate::config::PalmConfig;
use crate::types::{Frame, PalmRegion};

use super::common::{
    LetterboxInfo, RegionOfInterest, build_session, prepare_frame_with_size, sigmoid,
};

pub const PALM_INPUT_SIZE: u32 = 192;
const PALM_LANDMARKS: usize = 7;

pub struct PalmDetector {
    session: Session,
    anchors: Vec<[f32; 2]>,
    cfg: PalmConfig,
}

impl PalmDetector {
    pub fn new(model_path: &Path, cfg: PalmConfig, intra_threads: usize) -> Result<Self> {
        let session = build_session(model_path, intra_threads)
            .with_context(|| format!("failed to load palm detector from {}", model_path.display()))?;

        Ok(Self {
            session,
            anchors: generate_anchors(),
            cfg,
        })
    }

    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<PalmRegion>> {
        let (input, letterbox) = prepare_frame_with_size(frame, PALM_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run palm detector session")?;

        if outputs.len() < 2 {
            return Err(anyhow!(
                "palm detector returned {} outputs, expected at least 2",
                outputs.len()
            ));
        }

        let box_and_landmarks = outputs[0].try_extract_array::<f32>()?;
        let scores = outputs[1].try_extract_array::<f32>()?;

        let box_shape = box_and_landmarks.shape().to_vec();
        let score_shape = scores.shape().to_vec();

        decode_palm_outputs(
            box_and_landmarks
                .as_slice()
                .ok_or_else(|| anyhow!("palm boxes not contiguous"))?,
            &box_shape,
            scores
                .as_slice()
                .ok_or_else(|| anyhow!("palm scores not contiguous"))?,
            &score_shape,
            &self.anchors,
            &letterbox,
            &self.cfg,
        )
    }
}

fn decode_palm_outputs(
    box_landmark: &[f32],
    box_shape: &[usize],
    scores: &[f32],
    score_shape: &[usize],
    anchor_table: &[[f32; 2]],
    letterbox: &LetterboxInfo,
    cfg: &PalmConfig,
) -> Result<Vec<PalmRegion>> {
    if box_shape.len() < 3 {
        return Err(anyhow!(
            "unexpected palm box shape {:?}, need [batch, anchors, features]",
            box_shape
        ));
    }
    if score_shape.len() < 3 {
        return Err(anyhow!(
            "unexpected palm score shape {:?}, need [batch, anchors, 1]",
            score_shape
        ));
    }

    let anchor_dim = box_shape[box_shape.len() - 2];
    let feature_dim = box_shape[box_shape.len() - 1];
    let score_anchor_dim = score_shape[score_shape.len() - 2];
    let score_feature_dim = score_shape[score_shape.len() - 1];

    if feature_dim < 4 + PALM_LANDMARKS * 2 {
        return Err(anyhow!(
            "palm box feature dimension too small: {feature_dim}"
        ));
    }

    if anchor_dim != score_anchor_dim {
        return Err(anyhow!(
            "anchor dimension mismatch between boxes ({anchor_dim}) and scores ({score_anchor_dim})"
        ));
    }

    let anchors = NUM_ANCHORS.min(anchor_dim).min(anchor_table.len());
    let pad_bias_x = letterbox.pad_x / letterbox.scale;
    let pad_bias_y = letterbox.pad_y / letterbox.scale;
    let scale = letterbox.orig_w.max(letterbox.orig_h) as f32;
    let target_input = PALM_INPUT_SIZE as f32;

    let mut candidates = Vec::new();
    for (anchor_idx, anchor) in anchor_table.iter().enumerate().take(anchors) {
        let raw_score = *scores
            .get(anchor_idx * score_feature_dim)
            .ok_or_else(|| anyhow!("missing score for palm anchor {anchor_idx}"))?;
        let score = sigmoid(raw_score);
        if score < cfg.score_threshold {
            continue;
        }

        let offset = anchor_idx * feature_dim;
        let features = box_landmark
            .get(offset..offset + 4 + PALM_LANDMARKS * 2)
            .ok_or_else(|| anyhow!("missing box features for palm anchor {anchor_idx}"))?;

        let cx = features[0] / target_input + anchor[0];
        let cy = features[1] / target_input + anchor[1];
        let hw = features[2] / target_input / 2.0;
        let hh = features[3] / target_input / 2.0;

        let mut bbox = [
            (cx - hw) * scale - pad_bias_x,
            (cy - hh) * scale - pad_bias_y,
            (cx + hw) * scale - pad_bias_x,
            (cy + hh) * scale - pad_bias_y,
        ];
        if bbox[2] <= bbox[0] || bbox[3] <= bbox[1] {
            continue;
        }
        clamp_box(&mut bbox, letterbox.orig_w, letterbox.orig_h);

        let landmarks = features[4..]
            .chunks_exact(2)
            .map(|p| {
                (
                    (p[0] / target_input + anchor[0]) * scale - pad_bias_x,
                    (p[1] / target_input + anchor[1]) * scale - pad_bias_y,
                )
            })
            .collect();

        candidates.push(PalmRegion {
            bbox,
            landmarks,
            score,
        });
    }

    let kept = nms(&candidates, cfg.nms_threshold, cfg.top_k);
    Ok(kept
        .into_iter()
        .filter_map(|idx| candidates.get(idx).cloned())
        .collect())
}

/// Rotated square crop covering the whole hand behind a detected palm.
pub fn roi_from_palm(region: &PalmRegion) -> RegionOfInterest {
    let center = if region.landmarks.is_empty() {
        (
            (region.bbox[0] + region.bbox[2]) * 0.5,
            (region.bbox[1] + region.bbox[3]) * 0.5,
        )
    } else {
        let (sum_x, sum_y) = region
            .landmarks
            .iter()
            .fold((0.0_f32, 0.0_f32), |acc, p| (acc.0 + p.0, acc.1 + p.1));
        (
            sum_x / region.landmarks.len() as f32,
            sum_y / region.landmarks.len() as f32,
        )
    };

    let base_w = (region.bbox[2] - region.bbox[0]).abs();
    let base_h = (region.bbox[3] - region.bbox[1]).abs();
    let landmark_span = if region.landmarks.is_empty() {
        0.0
    } else {
        let (min_x, max_x, min_y, max_y) = region
            .landmarks
            .iter()
            .fold((f32::MAX, f32::MIN, f32::MAX, f32::MIN), |acc, (x, y)| {
                (acc.0.min(*x), acc.1.max(*x), acc.2.min(*y), acc.3.max(*y))
            });
        (max_x - min_x).max(max_y - min_y)
    };
    // Expand generously to avoid cropping fingers away.
    let side = base_w.max(base_h).max(landmark_span).max(80.0) * 2.4;

    RegionOfInterest {
        center,
        side,
        angle: estimate_orientation(region),
    }
}

// Palm keypoints 0 and 2 are the wrist and the middle finger MCP. The crop
// is rotated the same way as pose derived hand regions: fingers up.
const PALM_WRIST: usize = 0;
const PALM_MIDDLE_MCP: usize = 2;

fn estimate_orientation(region: &PalmRegion) -> f32 {
    let (Some(wrist), Some(middle)) = (
        region.landmarks.get(PALM_WRIST),
        region.landmarks.get(PALM_MIDDLE_MCP),
    ) else {
        return 0.0;
    };

    let (dx, dy) = (middle.0 - wrist.0, middle.1 - wrist.1);
    let len = dx.hypot(dy);
    if len < 1e-3 {
        return 0.0;
    }
    (dx / len).atan2(-dy / len)
}

fn nms(candidates: &[PalmRegion], threshold: f32, top_k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|a, b| {
        candidates[*b]
            .score
            .partial_cmp(&candidates[*a].score)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<usize> = Vec::new();
    'outer: for &idx in &order {
        if keep.len() >= top_k {
            break;
        }
        for &k in &keep {
            if iou(&candidates[idx].bbox, &candidates[k].bbox) >= threshold {
                continue 'outer;
            }
        }
        keep.push(idx);
    }
    keep
}

pub(crate) fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = inter_w * inter_h;
    if inter <= 0.0 {
        return 0.0;
    }

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

fn clamp_box(bbox: &mut [f32; 4], w: u32, h: u32) {
    let max_w = (w.saturating_sub(1)) as f32;
    let max_h = (h.saturating_sub(1)) as f32;
    bbox[0] = bbox[0].clamp(0.0, max_w);
    bbox[1] = bbox[1].clamp(0.0, max_h);
    bbox[2] = bbox[2].clamp(0.0, max_w);
    bbox[3] = bbox[3].clamp(0.0, max_h);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(bbox: [f32; 4], score: f32) -> PalmRegion {
        PalmRegion {
            bbox,
            landmarks: Vec::new(),
            score,
        }
    }

    #[test]
    fn test_nms_drops_overlapping_lower_scores() {
        let candidates = vec![
            region([0.0, 0.0, 10.0, 10.0], 0.6),
            region([1.0, 1.0, 11.0, 11.0], 0.9),
            region([50.0, 50.0, 60.0, 60.0], 0.7),
        ];
        assert_eq!(nms(&candidates, 0.3, 8), vec![1, 2]);
        assert_eq!(nms(&candidates, 0.3, 1), vec![1]);
    }

    #[test]
    fn test_iou_disjoint_and_identical() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_single_confident_anchor() {
        let anchors = generate_anchors();
        let features = 4 + PALM_LANDMARKS * 2;
        let mut boxes = vec![0.0f32; NUM_ANCHORS * features];
        let mut scores = vec![-10.0f32; NUM_ANCHORS];
        // Anchor 0 sits at (0.5 / 24, 0.5 / 24); give it a 48px box.
        boxes[2] = 48.0;
        boxes[3] = 48.0;
        scores[0] = 5.0;

        let letterbox = LetterboxInfo {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            orig_w: 192,
            orig_h: 192,
        };
        let regions = decode_palm_outputs(
            &boxes,
            &[1, NUM_ANCHORS, features],
            &scores,
            &[1, NUM_ANCHORS, 1],
            &anchors,
            &letterbox,
            &PalmConfig::default(),
        )
        .unwrap();

        assert_eq!(regions.len(), 1);
        let r = &regions[0];
        assert!(r.score > 0.99);
        assert_eq!(r.bbox[0], 0.0);
        assert!((r.bbox[2] - 28.0).abs() < 1e-3, "bbox={:?}", r.bbox);
        assert_eq!(r.landmarks.len(), PALM_LANDMARKS);
    }

    #[test]
    fn test_roi_from_palm_expands_box() {
        let roi = roi_from_palm(&region([100.0, 100.0, 200.0, 200.0], 0.9));
        assert_eq!(roi.center, (150.0, 150.0));
        assert!((roi.side - 240.0).abs() < 1e-3);
        assert_eq!(roi.angle, 0.0);
    }

    fn palm_pointing(dx: f32, dy: f32) -> PalmRegion {
        let wrist = (300.0, 300.0);
        let mut landmarks = vec![wrist; PALM_LANDMARKS];
        landmarks[PALM_MIDDLE_MCP] = (wrist.0 + dx, wrist.1 + dy);
        landmarks[1] = (wrist.0 + dx * 0.8 - dy * 0.3, wrist.1 + dy * 0.8 + dx * 0.3);
        PalmRegion {
            bbox: [250.0, 250.0, 350.0, 350.0],
            landmarks,
            score: 0.9,
        }
    }

    #[test]
    fn test_palm_orientation_keeps_fingers_up() {
        use std::f32::consts::{FRAC_PI_2, PI};

        let up = estimate_orientation(&palm_pointing(0.0, -40.0));
        assert!(up.abs() < 1e-4, "up={up}");

        let right = estimate_orientation(&palm_pointing(40.0, 0.0));
        assert!((right - FRAC_PI_2).abs() < 1e-4, "right={right}");

        let left = estimate_orientation(&palm_pointing(-40.0, 0.0));
        assert!((left + FRAC_PI_2).abs() < 1e-4, "left={left}");

        let down = estimate_orientation(&palm_pointing(0.0, 40.0));
        assert!((down.abs() - PI).abs() < 1e-4, "down={down}");
    }
}
