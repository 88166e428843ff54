//! Feature engine contract.
//!
//! The engine is an opaque collaborator: it accepts a correlation id and a
//! buffer, answers immediately with an accept/reject status, and later
//! invokes a [`CompletionCallback`] from a thread it owns.
//!
//! ```text
//!   gateway ──submit(id, mode, max, buf)──▶ engine ──▶ status (0 = accepted)
//!      ▲                                      │
//!      └──────── callback(id, output) ◀───────┘  (engine thread)
//! ```

mod synthetic;

use std::path::PathBuf;
use std::sync::Arc;

use facegate_config::EngineConfig;

use crate::id::CorrelationId;
use crate::protocol::{Attribute, FaceFeature, Landmark, Pose, Quality, Rect, join_floats};

pub use synthetic::SyntheticEngine;

/// Status returned by engine calls. Zero means accepted.
pub type EngineStatus = i32;

/// Status codes engines report.
pub mod status {
    pub const OK: i32 = 0;
    pub const UNINIT: i32 = 1;
    pub const PARAM_ERROR: i32 = 2;
    pub const NO_IMAGE: i32 = 3;
    pub const NO_RECT: i32 = 6;
    pub const CONFIG_ERROR: i32 = 13;
    pub const OTHER: i32 = 100;
}

/// Predict mode bit flags.
pub mod predict_mode {
    pub const RECT: i32 = 1;
    pub const LANDMARK: i32 = 1 << 2;
    pub const METRIC: i32 = (1 << 3) + LANDMARK;
    pub const LIVENESS: i32 = 1 << 4;
    pub const POSE: i32 = 1 << 5;
    pub const QUALITY: i32 = (1 << 6) + LANDMARK;
    /// Applied when a request leaves the mode unset.
    pub const DEFAULT: i32 = METRIC | QUALITY;
}

/// Embedding length produced per face.
pub const METRIC_LEN: usize = 256;
/// Landmarks produced per face.
pub const LANDMARK_COUNT: usize = 5;
/// Quality sub-scores produced per face.
pub const QUALITY_SCORE_COUNT: usize = 13;

/// Resolve the effective predict mode.
pub fn effective_mode(requested: i32) -> i32 {
    if requested <= 0 {
        predict_mode::DEFAULT
    } else {
        requested
    }
}

/// Resolve the effective face limit.
pub fn effective_max_faces(requested: i32) -> i32 {
    requested.max(1)
}

/// Invoked by the engine, on a thread it owns, once per accepted submission.
/// `None` means the engine produced no result at all.
pub type CompletionCallback = Arc<dyn Fn(CorrelationId, Option<EngineOutput>) + Send + Sync>;

/// Parameters handed to [`FeatureEngine::init`].
#[derive(Debug, Clone, Default)]
pub struct EngineInit {
    /// Raw contents of the engine settings file (JSON object of string values).
    pub settings: String,
    /// Path to the model configuration.
    pub model_path: PathBuf,
}

/// Result payload delivered to the completion callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    pub error_code: i32,
    pub features: Vec<EngineFeature>,
}

/// One face as produced by an engine, before wire formatting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineFeature {
    pub rect: Rect,
    pub liveness_score: f32,
    pub quality_score: f32,
    pub pose: Pose,
    pub metric: Vec<f32>,
    pub age: Attribute,
    pub gender: Attribute,
    pub glass: Attribute,
    pub hat: Attribute,
    pub landmarks: Vec<Landmark>,
    pub brightness: i32,
    pub quality_scores: Vec<f32>,
}

impl From<EngineFeature> for FaceFeature {
    fn from(f: EngineFeature) -> Self {
        FaceFeature {
            rect: f.rect,
            liveness_score: f.liveness_score,
            quality_score: f.quality_score,
            pose: f.pose,
            metric: join_floats(&f.metric),
            age: f.age,
            gender: f.gender,
            glass: f.glass,
            hat: f.hat,
            landmark: f.landmarks,
            quality: Quality {
                brightness: f.brightness,
                scores: join_floats(&f.quality_scores),
            },
        }
    }
}

/// An asynchronous feature-extraction engine.
///
/// `submit` is only ever called from one task at a time. Implementations may
/// block inside `submit` and `uninit`; callers run them on the blocking pool.
pub trait FeatureEngine: Send + Sync {
    /// Human-readable name of this engine (e.g. "synthetic").
    fn name(&self) -> &str;

    /// Load models and register the completion callback.
    fn init(&self, params: &EngineInit, callback: CompletionCallback) -> EngineStatus;

    /// Queue one buffer for extraction.
    fn submit(
        &self,
        id: CorrelationId,
        mode: i32,
        max_faces: i32,
        buffer: &[u8],
    ) -> EngineStatus;

    /// Release the engine. No callback fires after this returns.
    fn uninit(&self);
}

/// Construct the engine named by the configuration.
///
/// Returns `None` for unknown back ends; configuration validation rejects
/// those before this is reached.
pub fn select_engine(config: &EngineConfig) -> Option<Arc<dyn FeatureEngine>> {
    match config.backend.as_str() {
        "synthetic" => Some(Arc::new(SyntheticEngine::new())),
        other => {
            tracing::warn!(backend = other, "Unknown engine backend");
            None
        }
    }
}
