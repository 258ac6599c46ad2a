mod common;
mod face;
mod hand;
mod palm;
mod pose;

use anyhow::Result;

use crate::{
    config::{OutputStreams, ResolvedConfig, Thresholds},
    model_download::{ModelDownloadEvent, ModelKind, ensure_model_ready},
    types::{Frame, HandLandmarks, Handedness, HolisticOutput, Landmark, PalmRegion},
};

use self::{
    common::RegionOfInterest,
    face::FaceLandmarker,
    hand::{HandEstimate, HandLandmarker},
    palm::{PalmDetector, iou, roi_from_palm},
    pose::{PoseLandmarker, face_roi_from_pose, hand_roi_from_pose},
};

/// One frame in, every requested landmark set out.
pub(crate) trait HolisticEngine: Send + 'static {
    fn infer(&mut self, frame: &Frame) -> Result<HolisticOutput>;
}

/// Landmarks one hand inside a rotated crop.
trait HandStage {
    fn landmark(&mut self, frame: &Frame, roi: RegionOfInterest) -> Result<Option<HandEstimate>>;
}

impl HandStage for HandLandmarker {
    fn landmark(&mut self, frame: &Frame, roi: RegionOfInterest) -> Result<Option<HandEstimate>> {
        self.detect(frame, roi)
    }
}

// Landmark boxes overlapping more than this are the same hand.
const SAME_HAND_IOU: f32 = 0.3;

struct HandPipeline {
    landmarker: HandLandmarker,
    palm_detector: PalmDetector,
}

/// ONNX Runtime backed holistic graph. Only the models the requested streams
/// need are loaded. The pose is always reported when it ran, since arm states
/// are derived from it.
pub(crate) struct OrtEngine {
    pose: Option<PoseLandmarker>,
    hands: Option<HandPipeline>,
    face: Option<FaceLandmarker>,
    thresholds: Thresholds,
}

fn prepare_model(resolved: &ResolvedConfig, kind: ModelKind) -> Result<std::path::PathBuf> {
    let path = resolved.model_path(kind);
    ensure_model_ready(kind, &path, resolved.config.auto_download, |evt| {
        if !matches!(evt, ModelDownloadEvent::Progress { .. }) {
            log::debug!("model event: {evt:?}");
        }
    })?;
    log::info!("{} model ready at {}", kind.label(), path.display());
    Ok(path)
}

impl OrtEngine {
    pub(crate) fn new(resolved: &ResolvedConfig, streams: OutputStreams) -> Result<Self> {
        let cfg = &resolved.config;
        let threads = cfg.intra_threads;

        let pose = if streams.needs_pose_model() {
            let path = prepare_model(resolved, ModelKind::PoseLandmark)?;
            Some(PoseLandmarker::new(&path, cfg.thresholds.pose_score, threads)?)
        } else {
            None
        };

        let hands = if streams.hand {
            let hand_path = prepare_model(resolved, ModelKind::HandLandmark)?;
            let palm_path = prepare_model(resolved, ModelKind::PalmDetector)?;
            Some(HandPipeline {
                landmarker: HandLandmarker::new(&hand_path, cfg.thresholds.hand_score, threads)?,
                palm_detector: PalmDetector::new(&palm_path, cfg.palm.clone(), threads)?,
            })
        } else {
            None
        };

        let face = if streams.face {
            let path = prepare_model(resolved, ModelKind::FaceMesh)?;
            Some(FaceLandmarker::new(&path, cfg.thresholds.face_score, threads)?)
        } else {
            None
        };

        Ok(Self {
            pose,
            hands,
            face,
            thresholds: cfg.thresholds.clone(),
        })
    }
}

impl HolisticEngine for OrtEngine {
    fn infer(&mut self, frame: &Frame) -> Result<HolisticOutput> {
        let mut output = HolisticOutput::empty(frame.width, frame.height);

        let pose = match self.pose.as_mut() {
            Some(landmarker) => landmarker.detect(frame)?,
            None => None,
        };

        if let Some(hands) = self.hands.as_mut() {
            let visibility = self.thresholds.visibility;
            let mut detected: [Option<HandLandmarks>; 2] = [None, None];

            if let Some(pose) = &pose {
                for (slot, side) in detected
                    .iter_mut()
                    .zip([Handedness::Left, Handedness::Right])
                {
                    if let Some(roi) = hand_roi_from_pose(pose, side, visibility) {
                        *slot = hands
                            .landmarker
                            .detect(frame, roi)?
                            .map(|estimate| into_hand(estimate, side));
                    }
                }
            }

            if detected.iter().any(Option::is_none) {
                let regions = hands.palm_detector.detect(frame).unwrap_or_else(|err| {
                    log::warn!("palm detection failed: {err:?}");
                    Vec::new()
                });
                fill_from_palms(&mut hands.landmarker, frame, &regions, &mut detected)?;
                output.palm_regions = regions;
            }

            let [left, right] = detected;
            output.left_hand = left;
            output.right_hand = right;
        }

        if let (Some(face), Some(pose)) = (self.face.as_mut(), pose.as_ref()) {
            if let Some(roi) = face_roi_from_pose(pose, self.thresholds.visibility) {
                output.face = face.detect(frame, roi)?;
            }
        }

        output.pose = pose;
        Ok(output)
    }
}

fn into_hand(estimate: HandEstimate, handedness: Handedness) -> HandLandmarks {
    HandLandmarks {
        landmarks: estimate.landmarks,
        score: estimate.confidence,
        handedness,
    }
}

fn side_from_score(score: f32) -> Handedness {
    if score >= 0.5 {
        Handedness::Right
    } else {
        Handedness::Left
    }
}

fn landmark_bounds(landmarks: &[Landmark]) -> Option<[f32; 4]> {
    if landmarks.is_empty() {
        return None;
    }
    Some(landmarks.iter().fold(
        [f32::MAX, f32::MAX, f32::MIN, f32::MIN],
        |b, lm| [b[0].min(lm.x), b[1].min(lm.y), b[2].max(lm.x), b[3].max(lm.y)],
    ))
}

fn covers(bounds: &[f32; 4], (x, y): (f32, f32)) -> bool {
    x >= bounds[0] && x <= bounds[2] && y >= bounds[1] && y <= bounds[3]
}

/// Palm detections fill only the sides the pose did not already cover.
/// Palms over a hand that is already tracked are skipped, whichever side
/// the landmarker assigns them.
fn fill_from_palms<L: HandStage>(
    landmarker: &mut L,
    frame: &Frame,
    regions: &[PalmRegion],
    detected: &mut [Option<HandLandmarks>; 2],
) -> Result<()> {
    for region in regions {
        if detected.iter().all(Option::is_some) {
            break;
        }
        let known: Vec<[f32; 4]> = detected
            .iter()
            .flatten()
            .filter_map(|hand| landmark_bounds(&hand.landmarks))
            .collect();

        let palm_center = (
            (region.bbox[0] + region.bbox[2]) * 0.5,
            (region.bbox[1] + region.bbox[3]) * 0.5,
        );
        if known
            .iter()
            .any(|b| covers(b, palm_center) || iou(b, &region.bbox) > SAME_HAND_IOU)
        {
            log::trace!("palm at {palm_center:?} belongs to a tracked hand");
            continue;
        }

        let Some(estimate) = landmarker.landmark(frame, roi_from_palm(region))? else {
            continue;
        };
        if let Some(bounds) = landmark_bounds(&estimate.landmarks) {
            if known.iter().any(|b| iou(b, &bounds) > SAME_HAND_IOU) {
                continue;
            }
        }

        let side = side_from_score(estimate.handedness);
        let slot = match side {
            Handedness::Left => &mut detected[0],
            Handedness::Right => &mut detected[1],
        };
        if slot.is_none() {
            let mut hand = into_hand(estimate, side);
            hand.score *= region.score;
            *slot = Some(hand);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_from_handedness_score() {
        assert_eq!(side_from_score(0.9), Handedness::Right);
        assert_eq!(side_from_score(0.5), Handedness::Right);
        assert_eq!(side_from_score(0.1), Handedness::Left);
    }

    /// Returns a 40x40 hand around every crop centre it is given.
    struct FixedHand {
        handedness: f32,
        calls: usize,
    }

    impl HandStage for FixedHand {
        fn landmark(&mut self, _frame: &Frame, roi: RegionOfInterest) -> Result<Option<HandEstimate>> {
            self.calls += 1;
            Ok(Some(HandEstimate {
                landmarks: hand_around(roi.center),
                confidence: 0.9,
                handedness: self.handedness,
            }))
        }
    }

    fn hand_around((cx, cy): (f32, f32)) -> Vec<Landmark> {
        (0..21)
            .map(|i| {
                let t = i as f32 / 20.0;
                Landmark::new(cx - 20.0 + 40.0 * t, cy - 20.0 + 40.0 * (1.0 - t), 0.0, 1.0)
            })
            .collect()
    }

    fn palm(bbox: [f32; 4]) -> PalmRegion {
        PalmRegion {
            bbox,
            landmarks: Vec::new(),
            score: 0.8,
        }
    }

    fn blank_frame() -> Frame {
        Frame::new(vec![0u8; 640 * 480 * 4], 640, 480)
    }

    #[test]
    fn test_palm_over_tracked_hand_is_skipped() {
        let mut landmarker = FixedHand { handedness: 0.7, calls: 0 };
        let mut detected = [
            Some(HandLandmarks {
                landmarks: hand_around((120.0, 130.0)),
                score: 0.9,
                handedness: Handedness::Left,
            }),
            None,
        ];

        fill_from_palms(
            &mut landmarker,
            &blank_frame(),
            &[palm([105.0, 115.0, 135.0, 145.0])],
            &mut detected,
        )
        .unwrap();

        assert!(detected[1].is_none());
        assert_eq!(landmarker.calls, 0);
    }

    #[test]
    fn test_palm_elsewhere_fills_missing_side() {
        let mut landmarker = FixedHand { handedness: 0.7, calls: 0 };
        let mut detected = [
            Some(HandLandmarks {
                landmarks: hand_around((120.0, 130.0)),
                score: 0.9,
                handedness: Handedness::Left,
            }),
            None,
        ];

        fill_from_palms(
            &mut landmarker,
            &blank_frame(),
            &[
                palm([105.0, 115.0, 135.0, 145.0]),
                palm([420.0, 200.0, 460.0, 240.0]),
            ],
            &mut detected,
        )
        .unwrap();

        let right = detected[1].as_ref().expect("right hand from palm");
        assert_eq!(right.handedness, Handedness::Right);
        assert!((right.score - 0.72).abs() < 1e-5);
        assert_eq!(landmarker.calls, 1);
        assert_eq!(detected[0].as_ref().unwrap().landmarks[0].x, 100.0);
    }

    #[test]
    fn test_same_palm_twice_fills_one_side() {
        let mut landmarker = FixedHand { handedness: 0.2, calls: 0 };
        let mut detected = [None, None];

        fill_from_palms(
            &mut landmarker,
            &blank_frame(),
            &[
                palm([300.0, 300.0, 340.0, 340.0]),
                palm([302.0, 301.0, 342.0, 341.0]),
            ],
            &mut detected,
        )
        .unwrap();

        assert!(detected[0].is_some());
        assert!(detected[1].is_none());
        assert_eq!(landmarker.calls, 1);
    }
}
