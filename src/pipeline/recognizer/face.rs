use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::session::Session;
use ort::value::Tensor;

use super::common::{
    CropTransform, RegionOfInterest, build_session, decode_rows, prepare_rotated_crop, sigmoid,
};
use crate::types::{FACE_LANDMARKS, FaceLandmarks, Frame};

pub const FACE_INPUT_SIZE: u32 = 192;

pub struct FaceLandmarker {
    session: Session,
    score_threshold: f32,
}

impl FaceLandmarker {
    pub fn new(model_path: &Path, score_threshold: f32, intra_threads: usize) -> Result<Self> {
        Ok(Self {
            session: build_session(model_path, intra_threads)?,
            score_threshold,
        })
    }

    pub fn detect(&mut self, frame: &Frame, roi: RegionOfInterest) -> Result<Option<FaceLandmarks>> {
        let (input, transform) = prepare_rotated_crop(frame, roi, FACE_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run face mesh session")?;

        // Exports differ in output order, so pick outputs by size.
        let mut coords: Option<Vec<f32>> = None;
        let mut face_flag: Option<f32> = None;
        for idx in 0..outputs.len() {
            let Ok(array) = outputs[idx].try_extract_array::<f32>() else {
                continue;
            };
            if coords.is_none() && array.len() >= FACE_LANDMARKS * 3 {
                coords = Some(array.iter().copied().collect());
            } else if face_flag.is_none() && array.len() == 1 {
                face_flag = array.iter().next().copied();
            }
        }

        let coords = coords.ok_or_else(|| anyhow!("face mesh returned no landmark output"))?;
        let score = face_flag.map(sigmoid).unwrap_or(1.0);
        decode_face(&coords, score, &transform, self.score_threshold)
    }
}

fn decode_face(
    flat: &[f32],
    score: f32,
    transform: &CropTransform,
    score_threshold: f32,
) -> Result<Option<FaceLandmarks>> {
    if score < score_threshold {
        return Ok(None);
    }

    let landmarks = decode_rows(flat, FACE_LANDMARKS, 3)?
        .iter()
        .map(|row| transform.project_landmark(row[0], row[1], row[2]))
        .collect();

    Ok(Some(FaceLandmarks { landmarks, score }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_mesh_decodes_all_points() {
        let transform = CropTransform {
            center: (96.0, 96.0),
            side: 192.0,
            angle: 0.0,
            output_size: FACE_INPUT_SIZE,
            orig_w: 640,
            orig_h: 480,
        };
        let flat = vec![96.0f32; FACE_LANDMARKS * 3];
        let face = decode_face(&flat, 0.9, &transform, 0.5).unwrap().unwrap();
        assert_eq!(face.landmarks.len(), FACE_LANDMARKS);
        assert_eq!(face.landmarks[467].point(), (96.0, 96.0));

        assert!(decode_face(&flat, 0.2, &transform, 0.5).unwrap().is_none());
    }
}
