//! Self-contained engine back end.
//!
//! Runs a dedicated worker thread and completes every accepted submission
//! with one face derived deterministically from the SHA-256 of the buffer.
//! A buffer of only zero bytes yields "no face" (`status::NO_RECT`).

use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{
    CompletionCallback, EngineFeature, EngineInit, EngineOutput, EngineStatus, FeatureEngine,
    LANDMARK_COUNT, METRIC_LEN, QUALITY_SCORE_COUNT, effective_max_faces, effective_mode, status,
};
use crate::id::CorrelationId;
use crate::protocol::{Attribute, Landmark, Pose, Rect};

struct Job {
    id: CorrelationId,
    mode: i32,
    max_faces: i32,
    buffer: Vec<u8>,
}

struct Worker {
    tx: mpsc::Sender<Job>,
    handle: JoinHandle<()>,
}

/// Deterministic in-process engine.
#[derive(Default)]
pub struct SyntheticEngine {
    worker: Mutex<Option<Worker>>,
}

impl SyntheticEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FeatureEngine for SyntheticEngine {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn init(&self, params: &EngineInit, callback: CompletionCallback) -> EngineStatus {
        let mut worker = self.worker();
        if worker.is_some() {
            return status::OK;
        }

        if !params.settings.trim().is_empty()
            && serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&params.settings)
                .is_err()
        {
            warn!("Engine settings are not a JSON object");
            return status::CONFIG_ERROR;
        }

        let (tx, rx) = mpsc::channel::<Job>();
        let spawned = std::thread::Builder::new()
            .name("synthetic-engine".into())
            .spawn(move || {
                for job in rx {
                    let output = extract(&job);
                    callback(job.id, Some(output));
                }
            });

        match spawned {
            Ok(handle) => {
                debug!(model = %params.model_path.display(), "Synthetic engine initialised");
                *worker = Some(Worker { tx, handle });
                status::OK
            }
            Err(e) => {
                warn!(error = %e, "Failed to spawn engine worker");
                status::OTHER
            }
        }
    }

    fn submit(
        &self,
        id: CorrelationId,
        mode: i32,
        max_faces: i32,
        buffer: &[u8],
    ) -> EngineStatus {
        let worker = self.worker();
        let Some(worker) = worker.as_ref() else {
            return status::UNINIT;
        };
        if buffer.is_empty() {
            return status::PARAM_ERROR;
        }

        let job = Job {
            id,
            mode: effective_mode(mode),
            max_faces: effective_max_faces(max_faces),
            buffer: buffer.to_vec(),
        };
        match worker.tx.send(job) {
            Ok(()) => status::OK,
            Err(_) => status::UNINIT,
        }
    }

    fn uninit(&self) {
        let taken = self.worker().take();
        if let Some(Worker { tx, handle }) = taken {
            drop(tx);
            if handle.join().is_err() {
                warn!("Engine worker panicked");
            }
        }
    }
}

fn extract(job: &Job) -> EngineOutput {
    if job.buffer.iter().all(|&b| b == 0) {
        return EngineOutput {
            error_code: status::NO_RECT,
            features: Vec::new(),
        };
    }

    let digest = Sha256::digest(&job.buffer);
    let byte = |i: usize| digest[i % digest.len()];
    let unit = |i: usize| f32::from(byte(i)) / 255.0;

    let metric = (0..METRIC_LEN)
        .map(|i| f32::from(byte(i).wrapping_add(i as u8)) / 255.0)
        .collect();
    let landmarks = (0..LANDMARK_COUNT)
        .map(|i| Landmark {
            visible: 1,
            x: 10.0 + f32::from(byte(i * 2)),
            y: 10.0 + f32::from(byte(i * 2 + 1)),
        })
        .collect();
    let quality_scores = (0..QUALITY_SCORE_COUNT).map(|i| unit(i + 3)).collect();

    let x1 = f32::from(byte(0));
    let y1 = f32::from(byte(1));
    let feature = EngineFeature {
        rect: Rect {
            score: 0.5 + unit(2) / 2.0,
            x1,
            x2: x1 + 64.0,
            y1,
            y2: y1 + 64.0,
        },
        liveness_score: unit(4),
        quality_score: unit(5),
        pose: Pose {
            pitch: unit(6) * 30.0 - 15.0,
            roll: unit(7) * 30.0 - 15.0,
            yaw: unit(8) * 30.0 - 15.0,
        },
        metric,
        age: Attribute {
            classification: i32::from(byte(9) % 8),
            score: unit(10),
        },
        gender: Attribute {
            classification: i32::from(byte(11) % 2),
            score: unit(12),
        },
        glass: Attribute {
            classification: i32::from(byte(13) % 2),
            score: unit(14),
        },
        hat: Attribute {
            classification: i32::from(byte(15) % 2),
            score: unit(16),
        },
        landmarks,
        brightness: i32::from(byte(17)),
        quality_scores,
    };

    debug!(
        correlation_id = %job.id,
        mode = job.mode,
        max_faces = job.max_faces,
        "Synthetic extraction complete"
    );

    EngineOutput {
        error_code: status::OK,
        features: vec![feature],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn channel_callback() -> (CompletionCallback, mpsc::Receiver<(CorrelationId, Option<EngineOutput>)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let callback: CompletionCallback = Arc::new(move |id, output| {
            let _ = tx.lock().unwrap().send((id, output));
        });
        (callback, rx)
    }

    #[test]
    fn test_submit_before_init_is_rejected() {
        let engine = SyntheticEngine::new();
        assert_eq!(engine.submit(CorrelationId(0), 0, 1, b"abcd"), status::UNINIT);
    }

    #[test]
    fn test_empty_buffer_is_rejected() {
        let engine = SyntheticEngine::new();
        let (callback, _rx) = channel_callback();
        assert_eq!(engine.init(&EngineInit::default(), callback), status::OK);
        assert_eq!(engine.submit(CorrelationId(0), 0, 1, b""), status::PARAM_ERROR);
        engine.uninit();
    }

    #[test]
    fn test_bad_settings_fail_init() {
        let engine = SyntheticEngine::new();
        let (callback, _rx) = channel_callback();
        let params = EngineInit {
            settings: "[1, 2".into(),
            ..Default::default()
        };
        assert_eq!(engine.init(&params, callback), status::CONFIG_ERROR);
    }

    #[test]
    fn test_completion_is_deterministic() {
        let engine = SyntheticEngine::new();
        let (callback, rx) = channel_callback();
        engine.init(&EngineInit::default(), callback);

        assert_eq!(engine.submit(CorrelationId(1), 0, 1, b"abcd"), status::OK);
        assert_eq!(engine.submit(CorrelationId(2), 0, 1, b"abcd"), status::OK);

        let (id1, out1) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let (id2, out2) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(id1, CorrelationId(1));
        assert_eq!(id2, CorrelationId(2));

        let out1 = out1.unwrap();
        assert_eq!(out1.error_code, 0);
        assert_eq!(out1.features.len(), 1);
        assert_eq!(out1.features[0].metric.len(), METRIC_LEN);
        assert_eq!(out1.features[0].landmarks.len(), LANDMARK_COUNT);
        assert_eq!(out1.features[0].quality_scores.len(), QUALITY_SCORE_COUNT);
        assert_eq!(Some(out1), out2);

        engine.uninit();
    }

    #[test]
    fn test_zero_buffer_reports_no_face() {
        let engine = SyntheticEngine::new();
        let (callback, rx) = channel_callback();
        engine.init(&EngineInit::default(), callback);
        engine.submit(CorrelationId(9), 0, 1, &[0, 0, 0]);

        let (_, out) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let out = out.unwrap();
        assert_eq!(out.error_code, status::NO_RECT);
        assert!(out.features.is_empty());
        engine.uninit();
    }

    #[test]
    fn test_uninit_stops_accepting() {
        let engine = SyntheticEngine::new();
        let (callback, _rx) = channel_callback();
        engine.init(&EngineInit::default(), callback);
        engine.uninit();
        engine.uninit();
        assert_eq!(engine.submit(CorrelationId(0), 0, 1, b"x"), status::UNINIT);
    }
}
