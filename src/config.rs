use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::{HolisticError, Result};
use crate::model_download::{ModelKind, default_model_filename};

pub const CONFIG_FILENAME: &str = "holistic.toml";

/// Optional output channels requested at init time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputStreams {
    pub video: bool,
    pub pose: bool,
    pub hand: bool,
    pub face: bool,
}

impl Default for OutputStreams {
    fn default() -> Self {
        Self {
            video: true,
            pose: true,
            hand: true,
            face: true,
        }
    }
}

impl OutputStreams {
    /// Hands and face regions are derived from the pose, so it runs for any
    /// of them.
    pub fn needs_pose_model(&self) -> bool {
        self.pose || self.hand || self.face
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HolisticConfig {
    #[serde(default)]
    pub models: ModelFiles,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub palm: PalmConfig,
    #[serde(default)]
    pub smoothing: SmoothingConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    /// Intra-op threads per ONNX session
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
    /// Download known models that are missing from the model directory
    #[serde(default = "default_auto_download")]
    pub auto_download: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelFiles {
    #[serde(default = "default_pose_model")]
    pub pose: String,
    #[serde(default = "default_hand_model")]
    pub hand: String,
    #[serde(default = "default_palm_model")]
    pub palm: String,
    #[serde(default = "default_face_model")]
    pub face: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Thresholds {
    #[serde(default = "default_score")]
    pub pose_score: f32,
    #[serde(default = "default_score")]
    pub hand_score: f32,
    #[serde(default = "default_score")]
    pub face_score: f32,
    #[serde(default = "default_score")]
    pub visibility: f32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PalmConfig {
    #[serde(default = "default_score")]
    pub score_threshold: f32,
    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SmoothingConfig {
    #[serde(default = "default_smoothing_enabled")]
    pub enabled: bool,
    #[serde(default = "default_min_cutoff")]
    pub min_cutoff: f32,
    #[serde(default = "default_beta")]
    pub beta: f32,
    /// Frames further apart than this start a fresh filter
    #[serde(default = "default_max_gap_ms")]
    pub max_gap_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default)]
    pub index: u32,
    #[serde(default = "default_window_title")]
    pub window_title: String,
}

fn default_intra_threads() -> usize { 2 }
fn default_auto_download() -> bool { true }
fn default_pose_model() -> String { default_model_filename(ModelKind::PoseLandmark).to_string() }
fn default_hand_model() -> String { default_model_filename(ModelKind::HandLandmark).to_string() }
fn default_palm_model() -> String { default_model_filename(ModelKind::PalmDetector).to_string() }
fn default_face_model() -> String { default_model_filename(ModelKind::FaceMesh).to_string() }
fn default_score() -> f32 { 0.5 }
fn default_nms_threshold() -> f32 { 0.3 }
fn default_top_k() -> usize { 2 }
fn default_smoothing_enabled() -> bool { true }
fn default_min_cutoff() -> f32 { 1.0 }
fn default_beta() -> f32 { 0.05 }
fn default_max_gap_ms() -> u64 { 500 }
fn default_window_title() -> String { "holistic tracking".to_string() }

impl Default for HolisticConfig {
    fn default() -> Self {
        Self {
            models: ModelFiles::default(),
            thresholds: Thresholds::default(),
            palm: PalmConfig::default(),
            smoothing: SmoothingConfig::default(),
            camera: CameraConfig::default(),
            intra_threads: default_intra_threads(),
            auto_download: default_auto_download(),
        }
    }
}

impl Default for ModelFiles {
    fn default() -> Self {
        Self {
            pose: default_pose_model(),
            hand: default_hand_model(),
            palm: default_palm_model(),
            face: default_face_model(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            pose_score: default_score(),
            hand_score: default_score(),
            face_score: default_score(),
            visibility: default_score(),
        }
    }
}

impl Default for PalmConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_score(),
            nms_threshold: default_nms_threshold(),
            top_k: default_top_k(),
        }
    }
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            enabled: default_smoothing_enabled(),
            min_cutoff: default_min_cutoff(),
            beta: default_beta(),
            max_gap_ms: default_max_gap_ms(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            window_title: default_window_title(),
        }
    }
}

/// Config plus the directory its model filenames are relative to.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub model_dir: PathBuf,
    pub config: HolisticConfig,
}

impl ResolvedConfig {
    pub fn model_path(&self, kind: ModelKind) -> PathBuf {
        let name = match kind {
            ModelKind::PoseLandmark => &self.config.models.pose,
            ModelKind::HandLandmark => &self.config.models.hand,
            ModelKind::PalmDetector => &self.config.models.palm,
            ModelKind::FaceMesh => &self.config.models.face,
        };
        self.model_dir.join(name)
    }
}

impl HolisticConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|err| HolisticError::Config {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        toml::from_str(&content).map_err(|err| HolisticError::Config {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// `model_path` is either a model directory (optionally holding
    /// `holistic.toml`) or a TOML file next to the models.
    pub fn resolve(model_path: &Path) -> Result<ResolvedConfig> {
        if model_path.is_dir() {
            let candidate = model_path.join(CONFIG_FILENAME);
            let config = if candidate.is_file() {
                log::info!("loading holistic config from {}", candidate.display());
                Self::load(&candidate)?
            } else {
                Self::default()
            };
            return Ok(ResolvedConfig {
                model_dir: model_path.to_path_buf(),
                config,
            });
        }

        if model_path.is_file() {
            let config = Self::load(model_path)?;
            let model_dir = model_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            return Ok(ResolvedConfig { model_dir, config });
        }

        Err(HolisticError::ModelPathMissing(model_path.to_path_buf()))
    }
}
