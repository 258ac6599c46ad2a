use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::session::Session;
use ort::value::Tensor;

use super::common::{
    LetterboxInfo, RegionOfInterest, build_session, decode_rows, prepare_frame_with_size,
    sigmoid,
};
use crate::types::{Frame, Handedness, Landmark, POSE_LANDMARKS, PoseLandmarks};

pub const POSE_INPUT_SIZE: u32 = 256;
// 33 body landmarks plus 6 auxiliary ones, each (x, y, z, visibility, presence).
const POSE_MODEL_LANDMARKS: usize = 39;
const POSE_VALUES_PER_LANDMARK: usize = 5;

const NOSE: usize = 0;
const LEFT_EYE: usize = 2;
const RIGHT_EYE: usize = 5;
const MOUTH_LEFT: usize = 9;
const MOUTH_RIGHT: usize = 10;
const LEFT_WRIST: usize = 15;
const RIGHT_WRIST: usize = 16;
const LEFT_PINKY: usize = 17;
const RIGHT_PINKY: usize = 18;
const LEFT_INDEX: usize = 19;
const RIGHT_INDEX: usize = 20;

const MIN_ROI_SIDE: f32 = 32.0;

pub struct PoseLandmarker {
    session: Session,
    score_threshold: f32,
}

impl PoseLandmarker {
    pub fn new(model_path: &Path, score_threshold: f32, intra_threads: usize) -> Result<Self> {
        Ok(Self {
            session: build_session(model_path, intra_threads)?,
            score_threshold,
        })
    }

    pub fn detect(&mut self, frame: &Frame) -> Result<Option<PoseLandmarks>> {
        let (input, letterbox) = prepare_frame_with_size(frame, POSE_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run pose landmark session")?;

        if outputs.len() < 2 {
            return Err(anyhow!(
                "pose model returned {} outputs, expected at least 2",
                outputs.len()
            ));
        }

        let coords: Vec<f32> = outputs[0].try_extract_array::<f32>()?.iter().copied().collect();
        let score = outputs[1]
            .try_extract_array::<f32>()?
            .iter()
            .next()
            .copied()
            .unwrap_or(0.0);

        decode_pose(&coords, score, &letterbox, self.score_threshold)
    }
}

fn decode_pose(
    flat: &[f32],
    score: f32,
    letterbox: &LetterboxInfo,
    score_threshold: f32,
) -> Result<Option<PoseLandmarks>> {
    if score < score_threshold {
        return Ok(None);
    }

    let rows = decode_rows(flat, POSE_MODEL_LANDMARKS, POSE_VALUES_PER_LANDMARK)?;
    let landmarks = rows
        .iter()
        .take(POSE_LANDMARKS)
        .map(|row| letterbox.project_landmark(row[0], row[1], row[2], sigmoid(row[3])))
        .collect();

    Ok(Some(PoseLandmarks {
        landmarks,
        score: score.clamp(0.0, 1.0),
    }))
}

/// Hand region derived from the wrist, index and pinky pose landmarks of
/// the given side, rotated so the fingers point up in the crop.
pub fn hand_roi_from_pose(
    pose: &PoseLandmarks,
    side: Handedness,
    visibility_threshold: f32,
) -> Option<RegionOfInterest> {
    let (wrist, pinky, index) = match side {
        Handedness::Left => (LEFT_WRIST, LEFT_PINKY, LEFT_INDEX),
        Handedness::Right => (RIGHT_WRIST, RIGHT_PINKY, RIGHT_INDEX),
    };
    let wrist = pose.landmarks.get(wrist)?;
    let pinky = pose.landmarks.get(pinky)?;
    let index = pose.landmarks.get(index)?;
    if wrist.visibility < visibility_threshold {
        return None;
    }

    let middle = (
        (2.0 * index.x + pinky.x) / 3.0,
        (2.0 * index.y + pinky.y) / 3.0,
    );
    let dir = (middle.0 - wrist.x, middle.1 - wrist.y);
    let len = dir.0.hypot(dir.1);
    if len < 1.0 {
        return None;
    }

    let (ux, uy) = (dir.0 / len, dir.1 / len);
    Some(RegionOfInterest {
        center: (wrist.x + dir.0, wrist.y + dir.1),
        side: (len * 4.0).max(MIN_ROI_SIDE),
        angle: ux.atan2(-uy),
    })
}

/// Face region centered between the eyes and mouth, rotated to level the
/// eyes.
pub fn face_roi_from_pose(
    pose: &PoseLandmarks,
    visibility_threshold: f32,
) -> Option<RegionOfInterest> {
    let get = |idx: usize| pose.landmarks.get(idx).copied();
    let nose = get(NOSE)?;
    let left_eye = get(LEFT_EYE)?;
    let right_eye = get(RIGHT_EYE)?;
    let mouth_left = get(MOUTH_LEFT)?;
    let mouth_right = get(MOUTH_RIGHT)?;

    if [nose, left_eye, right_eye]
        .iter()
        .any(|lm| lm.visibility < visibility_threshold)
    {
        return None;
    }

    let eye_center = midpoint(&left_eye, &right_eye);
    let mouth_center = midpoint(&mouth_left, &mouth_right);
    let eye_vec = (left_eye.x - right_eye.x, left_eye.y - right_eye.y);
    let eye_dist = eye_vec.0.hypot(eye_vec.1);
    let face_height = (mouth_center.0 - eye_center.0).hypot(mouth_center.1 - eye_center.1);

    Some(RegionOfInterest {
        center: (
            (eye_center.0 + mouth_center.0) * 0.5,
            (eye_center.1 + mouth_center.1) * 0.5,
        ),
        side: (eye_dist * 4.0).max(face_height * 4.0).max(MIN_ROI_SIDE),
        angle: eye_vec.1.atan2(eye_vec.0),
    })
}

fn midpoint(a: &Landmark, b: &Landmark) -> (f32, f32) {
    ((a.x + b.x) * 0.5, (a.y + b.y) * 0.5)
}

#[cfg(test)]
mod tests {
    use std::f32::consts::FRAC_PI_2;

    use super::*;

    fn identity_letterbox() -> LetterboxInfo {
        LetterboxInfo {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            orig_w: 256,
            orig_h: 256,
        }
    }

    fn pose_with(points: &[(usize, f32, f32)]) -> PoseLandmarks {
        let mut landmarks = vec![Landmark::new(0.0, 0.0, 0.0, 1.0); POSE_LANDMARKS];
        for &(idx, x, y) in points {
            landmarks[idx] = Landmark::new(x, y, 0.0, 1.0);
        }
        PoseLandmarks {
            landmarks,
            score: 1.0,
        }
    }

    #[test]
    fn test_decode_pose_below_threshold_is_none() {
        let flat = vec![0.0f32; POSE_MODEL_LANDMARKS * POSE_VALUES_PER_LANDMARK];
        let pose = decode_pose(&flat, 0.2, &identity_letterbox(), 0.5).unwrap();
        assert!(pose.is_none());
    }

    #[test]
    fn test_decode_pose_keeps_body_landmarks() {
        let mut flat = vec![0.0f32; POSE_MODEL_LANDMARKS * POSE_VALUES_PER_LANDMARK];
        flat[5..10].copy_from_slice(&[10.0, 20.0, 3.0, 0.0, 0.0]);
        let pose = decode_pose(&flat, 0.9, &identity_letterbox(), 0.5)
            .unwrap()
            .unwrap();

        assert_eq!(pose.landmarks.len(), POSE_LANDMARKS);
        let lm = pose.landmarks[1];
        assert_eq!((lm.x, lm.y, lm.z), (10.0, 20.0, 3.0));
        assert!((lm.visibility - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_decode_pose_short_output_errors() {
        assert!(decode_pose(&[0.0; 10], 0.9, &identity_letterbox(), 0.5).is_err());
    }

    #[test]
    fn test_hand_roi_points_fingers_up() {
        let pose = pose_with(&[
            (LEFT_WRIST, 100.0, 200.0),
            (LEFT_INDEX, 100.0, 170.0),
            (LEFT_PINKY, 100.0, 170.0),
        ]);
        let roi = hand_roi_from_pose(&pose, Handedness::Left, 0.5).unwrap();
        assert_eq!(roi.center, (100.0, 170.0));
        assert!((roi.side - 120.0).abs() < 1e-3);
        assert!(roi.angle.abs() < 1e-6);

        let sideways = pose_with(&[
            (RIGHT_WRIST, 100.0, 100.0),
            (RIGHT_INDEX, 130.0, 100.0),
            (RIGHT_PINKY, 130.0, 100.0),
        ]);
        let roi = hand_roi_from_pose(&sideways, Handedness::Right, 0.5).unwrap();
        assert!((roi.angle - FRAC_PI_2).abs() < 1e-6);
    }

    #[test]
    fn test_hand_roi_requires_visible_wrist() {
        let mut pose = pose_with(&[
            (LEFT_WRIST, 100.0, 200.0),
            (LEFT_INDEX, 100.0, 170.0),
            (LEFT_PINKY, 100.0, 170.0),
        ]);
        pose.landmarks[LEFT_WRIST].visibility = 0.1;
        assert!(hand_roi_from_pose(&pose, Handedness::Left, 0.5).is_none());
    }

    #[test]
    fn test_face_roi_levels_eyes() {
        let pose = pose_with(&[
            (NOSE, 100.0, 110.0),
            (LEFT_EYE, 120.0, 100.0),
            (RIGHT_EYE, 80.0, 100.0),
            (MOUTH_LEFT, 110.0, 130.0),
            (MOUTH_RIGHT, 90.0, 130.0),
        ]);
        let roi = face_roi_from_pose(&pose, 0.5).unwrap();
        assert_eq!(roi.center, (100.0, 115.0));
        assert!((roi.side - 160.0).abs() < 1e-3);
        assert!(roi.angle.abs() < 1e-6);
    }
}
