//! Temporal liveness classification from dense facial landmarks.
//!
//! A printed photo or a phone screen held in front of the kiosk camera
//! yields a face that neither moves, blinks, nor shows depth relief. A live
//! person produces at least two of those three signals over a short window:
//!
//! - **Movement:** the nose tip drifts between frames (standard deviation of
//!   its 2D position over the last [`POSITION_HISTORY`] frames).
//! - **Blink:** the averaged Eye Aspect Ratio falls below
//!   [`BLINK_THRESHOLD`] and rises back above it on the next frame.
//! - **Depth:** the landmark z coordinates vary; a flat print has almost no
//!   z spread.
//!
//! One [`LivenessAnalyzer`] is owned by each video stream. Its history is
//! never shared, so no locking is needed on the capture path.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs and still images on a screen.
//! - **Does not block:** Video replays with natural motion rendered by a
//!   depth-estimating landmark model, or 3D masks.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum summed std-dev (x + y) of the nose tip for the movement signal.
pub const MOVEMENT_THRESHOLD: f32 = 0.02;
/// Eye Aspect Ratio below which the eyes are considered closed.
pub const BLINK_THRESHOLD: f32 = 0.25;
/// Minimum variance of landmark z for the depth signal.
pub const DEPTH_THRESHOLD: f32 = 0.0001;
/// Face frames required before a LIVE/FAKE decision is issued.
pub const MIN_FRAMES_FOR_LIVE: u64 = 10;
/// Signals (out of 3) required for a LIVE decision.
pub const MIN_SCORE_FOR_LIVE: u8 = 2;
/// Nose positions retained for the movement signal.
pub const POSITION_HISTORY: usize = 10;
/// EAR samples retained for the blink signal.
pub const EAR_HISTORY: usize = 5;

/// Face mesh point count without iris refinement.
pub const FACE_MESH_POINTS: usize = 468;
/// Face mesh point count with iris refinement.
pub const FACE_MESH_REFINED_POINTS: usize = 478;

/// Face mesh index of the nose tip.
pub const NOSE_TIP: usize = 4;

/// Landmark pairs used to compute one eye's aspect ratio.
#[derive(Debug, Clone, Copy)]
pub struct EyeLandmarks {
    pub vertical_a: (usize, usize),
    pub vertical_b: (usize, usize),
    pub horizontal: (usize, usize),
}

pub const LEFT_EYE: EyeLandmarks = EyeLandmarks {
    vertical_a: (7, 155),
    vertical_b: (163, 154),
    horizontal: (33, 145),
};

pub const RIGHT_EYE: EyeLandmarks = EyeLandmarks {
    vertical_a: (382, 249),
    vertical_b: (381, 390),
    horizontal: (362, 374),
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LivenessError {
    #[error("invalid landmark count: {0} (expected 468 or 478)")]
    PointCount(usize),
    #[error("invalid landmark value (NaN/Inf) at index {0}")]
    NonFinite(usize),
    #[error("degenerate eye landmarks: zero horizontal span")]
    DegenerateEye,
}

/// A normalised 3D landmark (x, y in image fractions, z relative depth).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    fn planar_distance(&self, other: &Point3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Landmarks of one face in one frame, as produced by the external
/// landmark extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceLandmarks {
    pub points: Vec<Point3>,
}

impl FaceLandmarks {
    pub fn new(points: Vec<Point3>) -> Self {
        Self { points }
    }

    fn validate(&self) -> Result<(), LivenessError> {
        let n = self.points.len();
        if n != FACE_MESH_POINTS && n != FACE_MESH_REFINED_POINTS {
            return Err(LivenessError::PointCount(n));
        }
        if let Some(i) = self
            .points
            .iter()
            .position(|p| !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()))
        {
            return Err(LivenessError::NonFinite(i));
        }
        Ok(())
    }

    fn eye_aspect_ratio(&self, eye: &EyeLandmarks) -> Result<f32, LivenessError> {
        let p = &self.points;
        let v1 = p[eye.vertical_a.0].planar_distance(&p[eye.vertical_a.1]);
        let v2 = p[eye.vertical_b.0].planar_distance(&p[eye.vertical_b.1]);
        let h = p[eye.horizontal.0].planar_distance(&p[eye.horizontal.1]);
        if h <= f32::EPSILON {
            return Err(LivenessError::DegenerateEye);
        }
        Ok((v1 + v2) / (2.0 * h))
    }

    /// Population variance of the z coordinate across all points.
    fn depth_variance(&self) -> f64 {
        let n = self.points.len() as f64;
        let mean = self.points.iter().map(|p| p.z as f64).sum::<f64>() / n;
        self.points
            .iter()
            .map(|p| {
                let d = p.z as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n
    }
}

/// Liveness classification for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LivenessState {
    NoFace,
    /// Warm-up: not enough face frames to decide.
    Checking,
    Live,
    Fake,
}

impl LivenessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LivenessState::NoFace => "NO_FACE",
            LivenessState::Checking => "CHECKING",
            LivenessState::Live => "LIVE",
            LivenessState::Fake => "FAKE",
        }
    }

    /// True for LIVE and FAKE, the states that may drive an action.
    pub fn is_decided(&self) -> bool {
        matches!(self, LivenessState::Live | LivenessState::Fake)
    }
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown liveness state: {0}")]
pub struct ParseLivenessStateError(String);

impl FromStr for LivenessState {
    type Err = ParseLivenessStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "NO_FACE" => Ok(LivenessState::NoFace),
            "CHECKING" => Ok(LivenessState::Checking),
            "LIVE" => Ok(LivenessState::Live),
            "FAKE" => Ok(LivenessState::Fake),
            _ => Err(ParseLivenessStateError(s.to_string())),
        }
    }
}

/// Per-frame signal breakdown behind a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LivenessSignals {
    pub has_movement: bool,
    pub has_blink: bool,
    pub has_depth: bool,
    /// Number of signals present (0..=3).
    pub score: u8,
    /// Frames observed by this analyzer so far, including NO_FACE frames.
    pub frames_seen: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub state: LivenessState,
    pub signals: LivenessSignals,
}

impl LivenessVerdict {
    /// A verdict with no signal detail, for callers forwarding a state
    /// computed elsewhere.
    pub fn from_state(state: LivenessState) -> Self {
        Self {
            state,
            signals: LivenessSignals::default(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.state == LivenessState::Live
    }
}

/// Tunable thresholds. Defaults are the module constants.
#[derive(Debug, Clone, PartialEq)]
pub struct LivenessConfig {
    pub movement_threshold: f32,
    pub blink_threshold: f32,
    pub depth_threshold: f32,
    pub min_frames_for_live: u64,
    pub min_score_for_live: u8,
    pub position_history: usize,
    pub ear_history: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            movement_threshold: MOVEMENT_THRESHOLD,
            blink_threshold: BLINK_THRESHOLD,
            depth_threshold: DEPTH_THRESHOLD,
            min_frames_for_live: MIN_FRAMES_FOR_LIVE,
            min_score_for_live: MIN_SCORE_FOR_LIVE,
            position_history: POSITION_HISTORY,
            ear_history: EAR_HISTORY,
        }
    }
}

/// Stateful liveness classifier for a single video stream.
///
/// When a frame has no face the accumulated history is kept, so a
/// momentary detection dropout does not erase evidence.
#[derive(Debug, Clone)]
pub struct LivenessAnalyzer {
    stream_id: String,
    config: LivenessConfig,
    positions: VecDeque<(f32, f32)>,
    ears: VecDeque<f32>,
    frames_seen: u64,
}

impl LivenessAnalyzer {
    pub fn new(stream_id: impl Into<String>, config: LivenessConfig) -> Self {
        // Capacities below the signal minimums would disable the signal.
        let position_history = config.position_history.max(2);
        let ear_history = config.ear_history.max(3);
        Self {
            stream_id: stream_id.into(),
            positions: VecDeque::with_capacity(position_history),
            ears: VecDeque::with_capacity(ear_history),
            config: LivenessConfig {
                position_history,
                ear_history,
                ..config
            },
            frames_seen: 0,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn position_samples(&self) -> usize {
        self.positions.len()
    }

    pub fn ear_samples(&self) -> usize {
        self.ears.len()
    }

    /// Feed one frame. `None` means the extractor found no face.
    ///
    /// Malformed landmarks are rejected before any state is touched.
    pub fn observe(
        &mut self,
        landmarks: Option<&FaceLandmarks>,
    ) -> Result<LivenessVerdict, LivenessError> {
        // Every well-formed frame counts toward warm-up, face or not; only
        // face frames feed the ring buffers.
        let Some(face) = landmarks else {
            self.frames_seen += 1;
            return Ok(LivenessVerdict {
                state: LivenessState::NoFace,
                signals: LivenessSignals {
                    frames_seen: self.frames_seen,
                    ..LivenessSignals::default()
                },
            });
        };

        face.validate()?;
        let left = face.eye_aspect_ratio(&LEFT_EYE)?;
        let right = face.eye_aspect_ratio(&RIGHT_EYE)?;
        let nose = face.points[NOSE_TIP];

        self.frames_seen += 1;

        push_bounded(
            &mut self.positions,
            (nose.x, nose.y),
            self.config.position_history,
        );
        push_bounded(&mut self.ears, (left + right) / 2.0, self.config.ear_history);

        let has_movement = self.movement_detected();
        let has_blink = self.blink_detected();
        let has_depth = face.depth_variance() > self.config.depth_threshold as f64;
        let score = has_movement as u8 + has_blink as u8 + has_depth as u8;

        let state = if self.frames_seen < self.config.min_frames_for_live {
            LivenessState::Checking
        } else if score >= self.config.min_score_for_live {
            LivenessState::Live
        } else {
            LivenessState::Fake
        };

        tracing::trace!(
            stream = %self.stream_id,
            frames_seen = self.frames_seen,
            has_movement,
            has_blink,
            has_depth,
            state = %state,
            "liveness frame"
        );

        Ok(LivenessVerdict {
            state,
            signals: LivenessSignals {
                has_movement,
                has_blink,
                has_depth,
                score,
                frames_seen: self.frames_seen,
            },
        })
    }

    fn movement_detected(&self) -> bool {
        if self.positions.len() < 2 {
            return false;
        }
        let std_x = population_std(self.positions.iter().map(|p| p.0 as f64));
        let std_y = population_std(self.positions.iter().map(|p| p.1 as f64));
        std_x + std_y > self.config.movement_threshold as f64
    }

    /// Fall-then-rise across the two most recent samples.
    fn blink_detected(&self) -> bool {
        let n = self.ears.len();
        if n < 3 {
            return false;
        }
        let threshold = self.config.blink_threshold;
        self.ears[n - 2] < threshold && self.ears[n - 1] > threshold
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, cap: usize) {
    if buf.len() == cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

fn population_std(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / n;
    let var = values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    var.sqrt()
}
