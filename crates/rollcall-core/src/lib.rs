//! rollcall-core — attendance decision engine.
//!
//! Nearest-neighbour identity matching over an enrolled gallery and a
//! per-stream temporal liveness classifier. Pure computation: no I/O, no
//! clocks beyond the timestamps carried on enrolled identities.

pub mod liveness;
pub mod matcher;
pub mod types;

pub use liveness::{
    FaceLandmarks, LivenessAnalyzer, LivenessConfig, LivenessError, LivenessSignals,
    LivenessState, LivenessVerdict, ParseLivenessStateError, Point3,
};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher, DEFAULT_DISTANCE_THRESHOLD};
pub use types::{Embedding, EmbeddingError, Gallery, GalleryEntry, Identity, SessionId};
