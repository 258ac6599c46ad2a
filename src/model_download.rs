use std::{
    fs,
    io::{self, Write},
    path::Path,
    time::Duration,
};

use anyhow::{Context, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    PoseLandmark,
    HandLandmark,
    PalmDetector,
    FaceMesh,
}

impl ModelKind {
    pub fn label(&self) -> &'static str {
        match self {
            ModelKind::PoseLandmark => "pose landmark",
            ModelKind::HandLandmark => "hand landmark",
            ModelKind::PalmDetector => "palm detector",
            ModelKind::FaceMesh => "face mesh",
        }
    }
}

const POSE_LANDMARK_MODEL_FILENAME: &str = "pose_estimation_mediapipe_2023mar.onnx";
const POSE_LANDMARK_MODEL_URL: &str = "https://github.com/opencv/opencv_zoo/raw/main/models/pose_estimation_mediapipe/pose_estimation_mediapipe_2023mar.onnx";
const HAND_LANDMARK_MODEL_FILENAME: &str = "handpose_estimation_mediapipe_2023feb.onnx";
const HAND_LANDMARK_MODEL_URL: &str = "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/handpose_estimation_mediapipe_2023feb.onnx";
const PALM_DETECTOR_MODEL_FILENAME: &str = "palm_detection_mediapipe_2023feb.onnx";
const PALM_DETECTOR_MODEL_URL: &str = "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/palm_detection_mediapipe_2023feb.onnx";
const FACE_MESH_MODEL_FILENAME: &str = "face_landmark.onnx";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

pub fn default_model_filename(kind: ModelKind) -> &'static str {
    match kind {
        ModelKind::PoseLandmark => POSE_LANDMARK_MODEL_FILENAME,
        ModelKind::HandLandmark => HAND_LANDMARK_MODEL_FILENAME,
        ModelKind::PalmDetector => PALM_DETECTOR_MODEL_FILENAME,
        ModelKind::FaceMesh => FACE_MESH_MODEL_FILENAME,
    }
}

/// The face mesh has no public ONNX mirror and must be provided locally.
pub fn model_url(kind: ModelKind) -> Option<&'static str> {
    match kind {
        ModelKind::PoseLandmark => Some(POSE_LANDMARK_MODEL_URL),
        ModelKind::HandLandmark => Some(HAND_LANDMARK_MODEL_URL),
        ModelKind::PalmDetector => Some(PALM_DETECTOR_MODEL_URL),
        ModelKind::FaceMesh => None,
    }
}

#[derive(Clone, Debug)]
pub enum ModelDownloadEvent {
    AlreadyPresent {
        model: ModelKind,
    },
    Started {
        model: ModelKind,
        total: Option<u64>,
    },
    Progress {
        model: ModelKind,
        downloaded: u64,
        total: Option<u64>,
    },
    Finished {
        model: ModelKind,
    },
}

/// A model counts as present when a non-empty file exists at its path.
pub fn model_present(model_path: &Path) -> bool {
    fs::metadata(model_path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// Makes sure `model_path` holds the model, fetching it from its known
/// source when `allow_download` is set.
pub fn ensure_model_ready<F>(
    model: ModelKind,
    model_path: &Path,
    allow_download: bool,
    mut on_event: F,
) -> anyhow::Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    if model_present(model_path) {
        on_event(ModelDownloadEvent::AlreadyPresent { model });
        on_event(ModelDownloadEvent::Finished { model });
        return Ok(());
    }
    if model_path.exists() {
        log::warn!(
            "{} model at {} is empty, treating it as missing",
            model.label(),
            model_path.display()
        );
    }

    if !allow_download {
        return Err(anyhow!(
            "{} model missing at {} and downloads are disabled",
            model.label(),
            model_path.display()
        ));
    }

    let Some(url) = model_url(model) else {
        return Err(anyhow!(
            "{} model missing at {} and has no download source",
            model.label(),
            model_path.display()
        ));
    };

    if let Some(parent) = model_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create model directory {}", parent.display()))?;
    }

    let mut progress: Option<ProgressBar> = None;
    let mut report = |event: ModelDownloadEvent| {
        match &event {
            ModelDownloadEvent::Started { total, .. } => {
                progress = Some(create_progress_bar(*total));
            }
            ModelDownloadEvent::Progress { downloaded, .. } => {
                if let Some(pb) = progress.as_ref() {
                    pb.set_position(*downloaded);
                }
            }
            ModelDownloadEvent::Finished { model } => {
                if let Some(pb) = progress.take() {
                    pb.finish_with_message(format!("{} model ready", model.label()));
                }
            }
            ModelDownloadEvent::AlreadyPresent { .. } => {}
        }
        on_event(event);
    };

    let staging = model_path.with_extension("download");
    let outcome = download_to_path(model, url, &staging, &mut report).and_then(|()| {
        fs::rename(&staging, model_path).with_context(|| {
            format!(
                "failed to move {} into place at {}",
                staging.display(),
                model_path.display()
            )
        })
    });
    if outcome.is_err() {
        let _ = fs::remove_file(&staging);
    }
    outcome.with_context(|| {
        format!(
            "failed to download {} model to {}",
            model.label(),
            model_path.display()
        )
    })?;

    report(ModelDownloadEvent::Finished { model });
    Ok(())
}

/// Forwards writes to `inner` and reports the running byte count.
struct ProgressWriter<'a, W, F> {
    inner: W,
    model: ModelKind,
    written: u64,
    total: Option<u64>,
    on_event: &'a mut F,
}

impl<W, F> Write for ProgressWriter<'_, W, F>
where
    W: Write,
    F: FnMut(ModelDownloadEvent),
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        (self.on_event)(ModelDownloadEvent::Progress {
            model: self.model,
            downloaded: self.written,
            total: self.total,
        });
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn download_to_path<F>(
    model: ModelKind,
    url: &str,
    dest: &Path,
    on_event: &mut F,
) -> anyhow::Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    log::info!("downloading {} model from {url}", model.label());

    let client = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .context("failed to build download client")?;
    let mut response = client
        .get(url)
        .send()
        .context("failed to start model download")?
        .error_for_status()
        .context("model download returned error status")?;

    let total = response.content_length();
    on_event(ModelDownloadEvent::Started { model, total });

    let file =
        fs::File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let mut writer = ProgressWriter {
        inner: file,
        model,
        written: 0,
        total,
        on_event,
    };
    let copied = io::copy(&mut response, &mut writer).context("failed while streaming model")?;
    if copied == 0 {
        return Err(anyhow!("model download from {url} was empty"));
    }
    writer
        .inner
        .sync_all()
        .context("failed to flush downloaded model to disk")?;

    log::info!("downloaded {copied} bytes for the {} model", model.label());
    Ok(())
}

fn create_progress_bar(total_size: Option<u64>) -> ProgressBar {
    match total_size {
        Some(total) if total > 0 => {
            let pb = ProgressBar::new(total);
            let style = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
            pb.set_style(style);
            pb
        }
        _ => {
            let pb = ProgressBar::new_spinner();
            let style = ProgressStyle::with_template("{spinner:.green} downloading model")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            pb.set_style(style);
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
    }
}
