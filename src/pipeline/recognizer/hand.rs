use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::session::Session;
use ort::value::Tensor;

use super::common::{
    CropTransform, RegionOfInterest, build_session, decode_rows, prepare_rotated_crop,
};
use crate::types::{Frame, HAND_LANDMARKS, Landmark};

pub const HAND_INPUT_SIZE: u32 = 224;

#[derive(Clone, Debug)]
pub struct HandEstimate {
    pub landmarks: Vec<Landmark>,
    pub confidence: f32,
    /// Model handedness score, `>= 0.5` meaning right.
    pub handedness: f32,
}

pub struct HandLandmarker {
    session: Session,
    score_threshold: f32,
}

impl HandLandmarker {
    pub fn new(model_path: &Path, score_threshold: f32, intra_threads: usize) -> Result<Self> {
        Ok(Self {
            session: build_session(model_path, intra_threads)?,
            score_threshold,
        })
    }

    pub fn detect(&mut self, frame: &Frame, roi: RegionOfInterest) -> Result<Option<HandEstimate>> {
        let (input, transform) = prepare_rotated_crop(frame, roi, HAND_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run hand landmark session")?;

        if outputs.len() < 1 {
            return Err(anyhow!("hand model returned no outputs"));
        }

        let coords: Vec<f32> = outputs[0].try_extract_array::<f32>()?.iter().copied().collect();
        let scalar = |idx: usize| -> f32 {
            if outputs.len() > idx {
                outputs[idx]
                    .try_extract_array::<f32>()
                    .ok()
                    .and_then(|arr| arr.iter().next().copied())
                    .unwrap_or(0.0)
            } else {
                0.0
            }
        };
        let confidence = scalar(1);
        let handedness = scalar(2);

        decode_hand(&coords, confidence, handedness, &transform, self.score_threshold)
    }
}

fn decode_hand(
    flat: &[f32],
    confidence: f32,
    handedness: f32,
    transform: &CropTransform,
    score_threshold: f32,
) -> Result<Option<HandEstimate>> {
    if confidence < score_threshold {
        return Ok(None);
    }

    let landmarks = decode_rows(flat, HAND_LANDMARKS, 3)?
        .iter()
        .map(|row| transform.project_landmark(row[0], row[1], row[2]))
        .collect();

    Ok(Some(HandEstimate {
        landmarks,
        confidence: confidence.clamp(0.0, 1.0),
        handedness,
    }))
}
