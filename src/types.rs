use std::time::Instant;

use image::RgbaImage;

use crate::pipeline::rgba_converter;

pub const POSE_LANDMARKS: usize = 33;
pub const HAND_LANDMARKS: usize = 21;
pub const FACE_LANDMARKS: usize = 468;

const FLAG_LEN: usize = 4;
const POSE_DATA_LEN: usize = POSE_LANDMARKS * 4;
const HAND_DATA_LEN: usize = HAND_LANDMARKS * 3;
const FACE_DATA_LEN: usize = FACE_LANDMARKS * 3;

pub const POSE_DATA_OFFSET: usize = FLAG_LEN;
pub const LEFT_HAND_DATA_OFFSET: usize = POSE_DATA_OFFSET + POSE_DATA_LEN;
pub const RIGHT_HAND_DATA_OFFSET: usize = LEFT_HAND_DATA_OFFSET + HAND_DATA_LEN;
pub const FACE_DATA_OFFSET: usize = RIGHT_HAND_DATA_OFFSET + HAND_DATA_LEN;

/// Number of `f32` slots `MediapipeHolisticTrackingDetectFrame` writes into
/// `detect_result_data`.
pub const RESULT_DATA_LEN: usize = FACE_DATA_OFFSET + FACE_DATA_LEN;

/// Number of `i32` slots written into `detect_result`.
pub const RESULT_CODES_LEN: usize = 4;

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(rgba: Vec<u8>, width: u32, height: u32) -> Self {
        Frame {
            rgba,
            width,
            height,
            timestamp: Instant::now(),
        }
    }
}

/// Pixel layout tag accepted by `MediapipeHolisticTrackingDetectFrame`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    Bgr,
    Rgb,
    Bgra,
    Rgba,
    Gray,
    Nv12,
    Yuyv,
}

impl ImageFormat {
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(ImageFormat::Bgr),
            1 => Some(ImageFormat::Rgb),
            2 => Some(ImageFormat::Bgra),
            3 => Some(ImageFormat::Rgba),
            4 => Some(ImageFormat::Gray),
            5 => Some(ImageFormat::Nv12),
            6 => Some(ImageFormat::Yuyv),
            _ => None,
        }
    }

    /// Expected byte length of a tightly packed buffer in this format.
    pub fn buffer_len(&self, width: u32, height: u32) -> usize {
        let pixels = (width as usize).saturating_mul(height as usize);
        match self {
            ImageFormat::Bgr | ImageFormat::Rgb => pixels.saturating_mul(3),
            ImageFormat::Bgra | ImageFormat::Rgba => pixels.saturating_mul(4),
            ImageFormat::Gray => pixels,
            ImageFormat::Nv12 => rgba_converter::nv12_len(width, height),
            ImageFormat::Yuyv => rgba_converter::yuyv_stride(width) * height as usize,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub visibility: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32, visibility: f32) -> Self {
        Self { x, y, z, visibility }
    }

    pub fn point(&self) -> (f32, f32) {
        (self.x, self.y)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handedness {
    Left,
    Right,
}

#[derive(Clone, Debug)]
pub struct PoseLandmarks {
    pub landmarks: Vec<Landmark>,
    pub score: f32,
}

#[derive(Clone, Debug)]
pub struct HandLandmarks {
    pub landmarks: Vec<Landmark>,
    pub score: f32,
    pub handedness: Handedness,
}

#[derive(Clone, Debug)]
pub struct FaceLandmarks {
    pub landmarks: Vec<Landmark>,
    pub score: f32,
}

#[derive(Clone, Debug)]
pub struct PalmRegion {
    pub bbox: [f32; 4],
    pub landmarks: Vec<(f32, f32)>,
    pub score: f32,
}

/// Landmarks produced for one frame, in frame pixel coordinates.
#[derive(Clone, Debug, Default)]
pub struct HolisticOutput {
    pub width: u32,
    pub height: u32,
    pub pose: Option<PoseLandmarks>,
    pub left_hand: Option<HandLandmarks>,
    pub right_hand: Option<HandLandmarks>,
    pub face: Option<FaceLandmarks>,
    pub palm_regions: Vec<PalmRegion>,
    pub annotated: Option<RgbaImage>,
}

impl HolisticOutput {
    pub fn empty(width: u32, height: u32) -> Self {
        HolisticOutput {
            width,
            height,
            ..Default::default()
        }
    }

    /// Writes the flat landmark payload. `out` must hold at least
    /// [`RESULT_DATA_LEN`] values; slots of missing streams are zeroed.
    pub fn pack_into(&self, out: &mut [f32]) {
        let out = &mut out[..RESULT_DATA_LEN];
        out.fill(0.0);

        let w = self.width.max(1) as f32;
        let h = self.height.max(1) as f32;

        if let Some(pose) = &self.pose {
            out[0] = 1.0;
            let block = &mut out[POSE_DATA_OFFSET..POSE_DATA_OFFSET + POSE_DATA_LEN];
            for (dst, lm) in block.chunks_exact_mut(4).zip(&pose.landmarks) {
                dst.copy_from_slice(&[lm.x / w, lm.y / h, lm.z / w, lm.visibility]);
            }
        }

        let hands = [
            (1, LEFT_HAND_DATA_OFFSET, &self.left_hand),
            (2, RIGHT_HAND_DATA_OFFSET, &self.right_hand),
        ];
        for (flag, offset, hand) in hands {
            if let Some(hand) = hand {
                out[flag] = 1.0;
                pack_xyz(&mut out[offset..offset + HAND_DATA_LEN], &hand.landmarks, w, h);
            }
        }

        if let Some(face) = &self.face {
            out[3] = 1.0;
            pack_xyz(
                &mut out[FACE_DATA_OFFSET..FACE_DATA_OFFSET + FACE_DATA_LEN],
                &face.landmarks,
                w,
                h,
            );
        }
    }
}

fn pack_xyz(block: &mut [f32], landmarks: &[Landmark], w: f32, h: f32) {
    for (dst, lm) in block.chunks_exact_mut(3).zip(landmarks) {
        dst.copy_from_slice(&[lm.x / w, lm.y / h, lm.z / w]);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArmState {
    NoResult,
    Up,
    Down,
}

impl ArmState {
    pub fn code(&self) -> i32 {
        match self {
            ArmState::NoResult => -1,
            ArmState::Up => 1,
            ArmState::Down => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FingerState {
    Extended,
    HalfBent,
    Folded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandGesture {
    NoGesture,
    One,
    Two,
    Three,
    Four,
    Five,
    Six,
    ThumbUp,
    Ok,
    Fist,
}

impl HandGesture {
    pub fn code(&self) -> i32 {
        match self {
            HandGesture::NoGesture => -1,
            HandGesture::One => 1,
            HandGesture::Two => 2,
            HandGesture::Three => 3,
            HandGesture::Four => 4,
            HandGesture::Five => 5,
            HandGesture::Six => 6,
            HandGesture::ThumbUp => 7,
            HandGesture::Ok => 8,
            HandGesture::Fist => 9,
        }
    }
}

/// Recognition codes handed back through `detect_result`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetectResult {
    pub left_arm: ArmState,
    pub right_arm: ArmState,
    pub left_hand: HandGesture,
    pub right_hand: HandGesture,
}

impl Default for DetectResult {
    fn default() -> Self {
        DetectResult {
            left_arm: ArmState::NoResult,
            right_arm: ArmState::NoResult,
            left_hand: HandGesture::NoGesture,
            right_hand: HandGesture::NoGesture,
        }
    }
}

impl DetectResult {
    pub fn codes(&self) -> [i32; RESULT_CODES_LEN] {
        [
            self.left_arm.code(),
            self.right_arm.code(),
            self.left_hand.code(),
            self.right_hand.code(),
        ]
    }
}
