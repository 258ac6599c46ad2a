use crate::types::{
    ArmState, DetectResult, FingerState, HAND_LANDMARKS, HandGesture, HandLandmarks, Handedness,
    HolisticOutput, Landmark, PoseLandmarks,
};

const LEFT_SHOULDER: usize = 11;
const RIGHT_SHOULDER: usize = 12;
const LEFT_WRIST: usize = 15;
const RIGHT_WRIST: usize = 16;

// Thumb tip to index tip distance, in hand spans, that counts as a pinch.
const OK_PINCH_DISTANCE: f32 = 0.15;

const FINGER_JOINTS: [[usize; 4]; 4] = [
    [5, 6, 7, 8],
    [9, 10, 11, 12],
    [13, 14, 15, 16],
    [17, 18, 19, 20],
];

/// Derives the four result codes from one frame of landmarks.
pub fn recognize(output: &HolisticOutput, visibility_threshold: f32) -> DetectResult {
    let (left_arm, right_arm) = match &output.pose {
        Some(pose) => (
            classify_arm(pose, Handedness::Left, visibility_threshold),
            classify_arm(pose, Handedness::Right, visibility_threshold),
        ),
        None => (ArmState::NoResult, ArmState::NoResult),
    };

    DetectResult {
        left_arm,
        right_arm,
        left_hand: hand_gesture(output.left_hand.as_ref()),
        right_hand: hand_gesture(output.right_hand.as_ref()),
    }
}

fn hand_gesture(hand: Option<&HandLandmarks>) -> HandGesture {
    hand.map(|hand| classify_hand(&hand.landmarks))
        .unwrap_or(HandGesture::NoGesture)
}

/// Up when the wrist is above the shoulder in the image.
pub fn classify_arm(
    pose: &PoseLandmarks,
    side: Handedness,
    visibility_threshold: f32,
) -> ArmState {
    let (shoulder, wrist) = match side {
        Handedness::Left => (LEFT_SHOULDER, LEFT_WRIST),
        Handedness::Right => (RIGHT_SHOULDER, RIGHT_WRIST),
    };
    let (Some(shoulder), Some(wrist)) = (pose.landmarks.get(shoulder), pose.landmarks.get(wrist))
    else {
        return ArmState::NoResult;
    };
    if shoulder.visibility < visibility_threshold || wrist.visibility < visibility_threshold {
        return ArmState::NoResult;
    }

    if wrist.y < shoulder.y {
        ArmState::Up
    } else {
        ArmState::Down
    }
}

pub fn classify_hand(landmarks: &[Landmark]) -> HandGesture {
    if landmarks.len() < HAND_LANDMARKS {
        return HandGesture::NoGesture;
    }

    let points = normalize_landmarks(landmarks);
    let thumb = classify_thumb(&points);
    let fingers = FINGER_JOINTS.map(|joints| classify_finger(&points, joints));
    let ext = |state: FingerState| state == FingerState::Extended;

    let pinch = distance3(points[4], points[8]);
    if pinch < OK_PINCH_DISTANCE && fingers[1..].iter().all(|state| ext(*state)) {
        return HandGesture::Ok;
    }

    if !ext(thumb) && fingers.iter().all(|state| *state == FingerState::Folded) {
        return HandGesture::Fist;
    }

    match (ext(thumb), fingers.map(ext)) {
        (true, [false, false, false, false]) => HandGesture::ThumbUp,
        (true, [false, false, false, true]) => HandGesture::Six,
        (true, [true, true, true, true]) => HandGesture::Five,
        (false, [true, false, false, false]) => HandGesture::One,
        (false, [true, true, false, false]) => HandGesture::Two,
        (false, [true, true, true, false]) => HandGesture::Three,
        (false, [true, true, true, true]) => HandGesture::Four,
        _ => HandGesture::NoGesture,
    }
}

fn normalize_landmarks(landmarks: &[Landmark]) -> Vec<[f32; 3]> {
    let mut min_x = f32::MAX;
    let mut min_y = f32::MAX;
    let mut max_x = f32::MIN;
    let mut max_y = f32::MIN;

    for lm in landmarks {
        min_x = min_x.min(lm.x);
        min_y = min_y.min(lm.y);
        max_x = max_x.max(lm.x);
        max_y = max_y.max(lm.y);
    }

    let span = (max_x - min_x).max(max_y - min_y).max(1e-3);
    landmarks
        .iter()
        .map(|lm| [(lm.x - min_x) / span, (lm.y - min_y) / span, lm.z / span])
        .collect()
}

fn classify_finger(points: &[[f32; 3]], idx: [usize; 4]) -> FingerState {
    let wrist = points[0];
    let mcp = points[idx[0]];
    let pip = points[idx[1]];
    let dip = points[idx[2]];
    let tip = points[idx[3]];

    let dist_tip = distance3(tip, wrist);
    let dist_pip = distance3(pip, wrist);
    let dist_mcp = distance3(mcp, wrist);

    let straightness = average_straightness(sub(pip, mcp), sub(dip, pip), sub(tip, dip));

    let extension = dist_tip - dist_pip;
    let reach = dist_tip - dist_mcp;

    if extension > 0.15 && straightness > 0.40 && reach > 0.06 {
        FingerState::Extended
    } else if extension < 0.08 || straightness < 0.18 || reach < 0.05 {
        FingerState::Folded
    } else {
        FingerState::HalfBent
    }
}

fn classify_thumb(points: &[[f32; 3]]) -> FingerState {
    let wrist = points[0];
    let cmc = points[1];
    let mcp = points[2];
    let ip = points[3];
    let tip = points[4];
    let index_mcp = points[5];
    let pinky_mcp = points[17];

    let dist_tip_wrist = distance3(tip, wrist);
    let dist_ip_wrist = distance3(ip, wrist);
    let dist_mcp_wrist = distance3(mcp, wrist);

    let straightness = average_straightness(sub(mcp, cmc), sub(ip, mcp), sub(tip, ip));

    // How close the tip sits to the palm.
    let spread = distance3(tip, index_mcp).min(distance3(tip, pinky_mcp));
    let extension = dist_tip_wrist - dist_ip_wrist;
    let reach = dist_tip_wrist - dist_mcp_wrist;

    if spread < 0.25 && (straightness < 0.28 || reach < 0.15) {
        FingerState::Folded
    } else if dist_tip_wrist > 0.30 && straightness > 0.28 && extension > 0.08 {
        FingerState::Extended
    } else {
        FingerState::HalfBent
    }
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn distance3(a: [f32; 3], b: [f32; 3]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

fn average_straightness(a: [f32; 3], b: [f32; 3], c: [f32; 3]) -> f32 {
    let ab = dot(normalize(a), normalize(b));
    let bc = dot(normalize(b), normalize(c));
    ((ab + bc) / 2.0).clamp(-1.0, 1.0)
}

fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn normalize(v: [f32; 3]) -> [f32; 3] {
    let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if len < 1e-5 {
        [0.0, 0.0, 0.0]
    } else {
        [v[0] / len, v[1] / len, v[2] / len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::POSE_LANDMARKS;

    type Chain = [(f32, f32); 4];

    const THUMB_OPEN: Chain = [(-0.8, -0.5), (-1.6, -1.0), (-2.4, -1.5), (-3.2, -2.0)];
    const THUMB_CURLED: Chain = [(-0.8, -0.5), (-1.2, -1.0), (-0.8, -1.5), (-0.4, -1.3)];
    const FINGER_X: [f32; 4] = [-1.5, -0.5, 0.5, 1.5];

    fn finger(x: f32, extended: bool) -> Chain {
        if extended {
            [(x, -2.0), (x, -3.0), (x, -3.8), (x, -4.5)]
        } else {
            [(x, -2.0), (x, -2.8), (x, -2.3), (x, -1.9)]
        }
    }

    // Hand in model-agnostic units, wrist at the origin and fingers pointing up.
    fn build_hand(thumb: Chain, fingers: [Chain; 4]) -> Vec<Landmark> {
        std::iter::once((0.0, 0.0))
            .chain(thumb)
            .chain(fingers.into_iter().flatten())
            .map(|(x, y)| Landmark::new(320.0 + 40.0 * x, 300.0 + 40.0 * y, 0.0, 1.0))
            .collect()
    }

    fn hand(thumb: Chain, extended: [bool; 4]) -> Vec<Landmark> {
        let fingers = [0, 1, 2, 3].map(|i| finger(FINGER_X[i], extended[i]));
        build_hand(thumb, fingers)
    }

    #[test]
    fn test_counting_gestures() {
        let cases = [
            (THUMB_CURLED, [true, false, false, false], HandGesture::One),
            (THUMB_CURLED, [true, true, false, false], HandGesture::Two),
            (THUMB_CURLED, [true, true, true, false], HandGesture::Three),
            (THUMB_CURLED, [true, true, true, true], HandGesture::Four),
            (THUMB_OPEN, [true, true, true, true], HandGesture::Five),
            (THUMB_OPEN, [false, false, false, true], HandGesture::Six),
        ];
        for (thumb, extended, expected) in cases {
            assert_eq!(classify_hand(&hand(thumb, extended)), expected, "{extended:?}");
        }
    }

    #[test]
    fn test_thumb_up_and_fist() {
        assert_eq!(
            classify_hand(&hand(THUMB_OPEN, [false; 4])),
            HandGesture::ThumbUp
        );
        assert_eq!(
            classify_hand(&hand(THUMB_CURLED, [false; 4])),
            HandGesture::Fist
        );
    }

    #[test]
    fn test_ok_sign_pinches_thumb_and_index() {
        let thumb = [(-0.8, -0.5), (-1.6, -1.0), (-2.0, -1.7), (-1.8, -2.4)];
        let index = [(-1.5, -2.0), (-1.8, -2.9), (-2.0, -2.8), (-1.85, -2.45)];
        let landmarks = build_hand(
            thumb,
            [
                index,
                finger(FINGER_X[1], true),
                finger(FINGER_X[2], true),
                finger(FINGER_X[3], true),
            ],
        );
        assert_eq!(classify_hand(&landmarks), HandGesture::Ok);
    }

    #[test]
    fn test_unmapped_pattern_and_short_input() {
        // Index and pinky only.
        assert_eq!(
            classify_hand(&hand(THUMB_CURLED, [true, false, false, true])),
            HandGesture::NoGesture
        );
        assert_eq!(
            classify_hand(&[Landmark::default(); 5]),
            HandGesture::NoGesture
        );
    }

    fn pose_with(left_wrist_y: f32, right_wrist_y: f32) -> PoseLandmarks {
        let mut landmarks = vec![Landmark::new(0.0, 0.0, 0.0, 1.0); POSE_LANDMARKS];
        landmarks[LEFT_SHOULDER] = Landmark::new(200.0, 200.0, 0.0, 0.9);
        landmarks[RIGHT_SHOULDER] = Landmark::new(100.0, 200.0, 0.0, 0.9);
        landmarks[LEFT_WRIST] = Landmark::new(210.0, left_wrist_y, 0.0, 0.9);
        landmarks[RIGHT_WRIST] = Landmark::new(90.0, right_wrist_y, 0.0, 0.9);
        PoseLandmarks {
            landmarks,
            score: 1.0,
        }
    }

    #[test]
    fn test_arm_up_when_wrist_above_shoulder() {
        let pose = pose_with(120.0, 320.0);
        assert_eq!(classify_arm(&pose, Handedness::Left, 0.5), ArmState::Up);
        assert_eq!(classify_arm(&pose, Handedness::Right, 0.5), ArmState::Down);
    }

    #[test]
    fn test_arm_needs_visible_joints() {
        let mut pose = pose_with(120.0, 320.0);
        pose.landmarks[LEFT_WRIST].visibility = 0.2;
        assert_eq!(
            classify_arm(&pose, Handedness::Left, 0.5),
            ArmState::NoResult
        );
    }

    #[test]
    fn test_recognize_fills_codes() {
        let mut output = HolisticOutput::empty(640, 480);
        assert_eq!(recognize(&output, 0.5).codes(), [-1, -1, -1, -1]);

        output.pose = Some(pose_with(120.0, 320.0));
        output.right_hand = Some(HandLandmarks {
            landmarks: hand(THUMB_OPEN, [true; 4]),
            score: 0.9,
            handedness: Handedness::Right,
        });
        assert_eq!(recognize(&output, 0.5).codes(), [1, 2, -1, 5]);
    }
}
