use std::time::{Duration, Instant};

use crate::config::SmoothingConfig;
use crate::types::{HolisticOutput, Landmark};

const DERIVATIVE_CUTOFF: f32 = 1.0;
const FALLBACK_DT: f32 = 1.0 / 30.0;

struct LowPassFilter {
    prev: Option<f32>,
}

impl LowPassFilter {
    fn new() -> Self {
        Self { prev: None }
    }

    fn filter(&mut self, value: f32, alpha: f32) -> f32 {
        let result = match self.prev {
            Some(prev) => alpha * value + (1.0 - alpha) * prev,
            None => value,
        };
        self.prev = Some(result);
        result
    }
}

/// alpha = 1 / (1 + tau/Te), tau = 1/(2*pi*fc)
fn smoothing_factor(te: f32, cutoff: f32) -> f32 {
    let r = 2.0 * std::f32::consts::PI * cutoff * te;
    r / (r + 1.0)
}

struct ScalarFilter {
    x_filter: LowPassFilter,
    dx_filter: LowPassFilter,
    prev_value: Option<f32>,
}

impl ScalarFilter {
    fn new() -> Self {
        Self {
            x_filter: LowPassFilter::new(),
            dx_filter: LowPassFilter::new(),
            prev_value: None,
        }
    }

    fn filter(&mut self, value: f32, dt: f32, min_cutoff: f32, beta: f32) -> f32 {
        let dx = match self.prev_value {
            Some(prev) if dt > 0.0 => (value - prev) / dt,
            _ => 0.0,
        };
        self.prev_value = Some(value);

        let edx = self
            .dx_filter
            .filter(dx, smoothing_factor(dt, DERIVATIVE_CUTOFF));
        let cutoff = min_cutoff + beta * edx.abs();
        self.x_filter.filter(value, smoothing_factor(dt, cutoff))
    }
}

/// One Euro filter over a fixed-size landmark set.
struct LandmarkFilter {
    coords: Vec<[ScalarFilter; 3]>,
}

impl LandmarkFilter {
    fn new(len: usize) -> Self {
        Self {
            coords: (0..len)
                .map(|_| std::array::from_fn(|_| ScalarFilter::new()))
                .collect(),
        }
    }

    fn apply(&mut self, landmarks: &mut [Landmark], dt: f32, min_cutoff: f32, beta: f32) {
        for (lm, filters) in landmarks.iter_mut().zip(self.coords.iter_mut()) {
            lm.x = filters[0].filter(lm.x, dt, min_cutoff, beta);
            lm.y = filters[1].filter(lm.y, dt, min_cutoff, beta);
            lm.z = filters[2].filter(lm.z, dt, min_cutoff, beta);
        }
    }
}

/// Per-stream filter state. A stream missing for one frame starts over.
fn smooth_stream(
    slot: &mut Option<LandmarkFilter>,
    landmarks: Option<&mut Vec<Landmark>>,
    dt: f32,
    cfg: &SmoothingConfig,
) {
    match landmarks {
        Some(landmarks) => {
            let filter = slot.get_or_insert_with(|| LandmarkFilter::new(landmarks.len()));
            if filter.coords.len() != landmarks.len() {
                *filter = LandmarkFilter::new(landmarks.len());
            }
            filter.apply(landmarks, dt, cfg.min_cutoff, cfg.beta);
        }
        None => *slot = None,
    }
}

pub struct HolisticSmoother {
    cfg: SmoothingConfig,
    pose: Option<LandmarkFilter>,
    left_hand: Option<LandmarkFilter>,
    right_hand: Option<LandmarkFilter>,
    face: Option<LandmarkFilter>,
    last_time: Option<Instant>,
    last_size: Option<(u32, u32)>,
}

impl HolisticSmoother {
    pub fn new(cfg: SmoothingConfig) -> Self {
        Self {
            cfg,
            pose: None,
            left_hand: None,
            right_hand: None,
            face: None,
            last_time: None,
            last_size: None,
        }
    }

    pub fn reset(&mut self) {
        self.pose = None;
        self.left_hand = None;
        self.right_hand = None;
        self.face = None;
        self.last_time = None;
        self.last_size = None;
    }

    /// Filter state only carries over between consecutive frames of one
    /// video: same size and close in time.
    fn continues(&self, size: (u32, u32), timestamp: Instant) -> bool {
        let max_gap = Duration::from_millis(self.cfg.max_gap_ms);
        match (self.last_size, self.last_time) {
            (Some(prev_size), Some(prev)) => {
                prev_size == size && timestamp.saturating_duration_since(prev) <= max_gap
            }
            _ => false,
        }
    }

    pub fn apply(&mut self, output: &mut HolisticOutput, timestamp: Instant) {
        if !self.cfg.enabled {
            return;
        }

        let size = (output.width, output.height);
        if self.last_time.is_some() && !self.continues(size, timestamp) {
            log::debug!("frame does not continue the previous one, resetting smoother");
            self.reset();
        }
        self.last_size = Some(size);

        let dt = match self.last_time {
            Some(prev) => {
                let d = timestamp.saturating_duration_since(prev).as_secs_f32();
                if d > 0.0 { d } else { FALLBACK_DT }
            }
            None => FALLBACK_DT,
        };
        self.last_time = Some(timestamp);

        smooth_stream(
            &mut self.pose,
            output.pose.as_mut().map(|p| &mut p.landmarks),
            dt,
            &self.cfg,
        );
        smooth_stream(
            &mut self.left_hand,
            output.left_hand.as_mut().map(|h| &mut h.landmarks),
            dt,
            &self.cfg,
        );
        smooth_stream(
            &mut self.right_hand,
            output.right_hand.as_mut().map(|h| &mut h.landmarks),
            dt,
            &self.cfg,
        );
        smooth_stream(
            &mut self.face,
            output.face.as_mut().map(|f| &mut f.landmarks),
            dt,
            &self.cfg,
        );
    }
}
