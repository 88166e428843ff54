//! A scriptable [`FeatureEngine`] double.
//!
//! Records every submission and completes, holds, or rejects it according
//! to its [`Script`]. Completions are always invoked from a separate OS
//! thread, as a native engine would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use facegate_core::engine::{
    CompletionCallback, EngineFeature, EngineInit, EngineOutput, FeatureEngine, status,
};
use facegate_core::id::CorrelationId;
use facegate_core::protocol::{Landmark, Rect};

/// How the engine answers submissions.
#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    /// Accept and complete right away with [`sample_output`].
    AutoComplete,
    /// Accept and wait for [`ScriptedEngine::complete`].
    Manual,
    /// Refuse with the given status.
    Reject(i32),
    /// Block inside `submit` until [`ScriptedEngine::release_held`], then
    /// accept like [`Script::Manual`].
    Hold,
}

/// One call to `submit`.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub id: CorrelationId,
    pub mode: i32,
    pub max_faces: i32,
    pub buffer: Vec<u8>,
}

pub struct ScriptedEngine {
    script: Mutex<Script>,
    callback: Mutex<Option<CompletionCallback>>,
    submissions: Mutex<Vec<Submission>>,
    released: Mutex<bool>,
    gate: Condvar,
    inits: AtomicUsize,
    uninits: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            callback: Mutex::new(None),
            submissions: Mutex::new(Vec::new()),
            released: Mutex::new(false),
            gate: Condvar::new(),
            inits: AtomicUsize::new(0),
            uninits: AtomicUsize::new(0),
        })
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn uninit_count(&self) -> usize {
        self.uninits.load(Ordering::SeqCst)
    }

    /// Poll until at least `n` submissions were recorded.
    ///
    /// # Panics
    ///
    /// Panics if that takes longer than five seconds.
    pub async fn wait_for_submissions(&self, n: usize) -> Vec<Submission> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let seen = self.submissions();
                if seen.len() >= n {
                    return seen;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("engine did not receive {n} submissions"))
    }

    /// Let every submission blocked by [`Script::Hold`] return.
    pub fn release_held(&self) {
        *self.released.lock().unwrap() = true;
        self.gate.notify_all();
    }

    /// Fire the completion callback for `id` from another thread and wait
    /// for it to return.
    pub fn complete(&self, id: CorrelationId, output: Option<EngineOutput>) {
        let callback = self
            .callback
            .lock()
            .unwrap()
            .clone()
            .expect("engine not initialised");
        std::thread::spawn(move || callback(id, output))
            .join()
            .expect("completion callback panicked");
    }
}

impl FeatureEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn init(&self, _params: &EngineInit, callback: CompletionCallback) -> i32 {
        self.inits.fetch_add(1, Ordering::SeqCst);
        *self.callback.lock().unwrap() = Some(callback);
        status::OK
    }

    fn submit(&self, id: CorrelationId, mode: i32, max_faces: i32, buffer: &[u8]) -> i32 {
        self.submissions.lock().unwrap().push(Submission {
            id,
            mode,
            max_faces,
            buffer: buffer.to_vec(),
        });

        let script = self.script.lock().unwrap().clone();
        match script {
            Script::AutoComplete => {
                let callback = self.callback.lock().unwrap().clone();
                if let Some(callback) = callback {
                    std::thread::spawn(move || callback(id, Some(sample_output())));
                }
                status::OK
            }
            Script::Manual => status::OK,
            Script::Reject(code) => code,
            Script::Hold => {
                let mut released = self.released.lock().unwrap();
                while !*released {
                    released = self.gate.wait(released).unwrap();
                }
                status::OK
            }
        }
    }

    fn uninit(&self) {
        self.uninits.fetch_add(1, Ordering::SeqCst);
        self.callback.lock().unwrap().take();
    }
}

/// A single well-formed face.
pub fn sample_feature() -> EngineFeature {
    EngineFeature {
        rect: Rect {
            score: 0.99,
            x1: 10.0,
            x2: 110.0,
            y1: 20.0,
            y2: 120.0,
        },
        liveness_score: 0.9,
        quality_score: 0.8,
        metric: vec![0.25; 256],
        landmarks: vec![
            Landmark {
                visible: 1,
                x: 1.0,
                y: 2.0,
            };
            5
        ],
        brightness: 128,
        quality_scores: vec![0.5; 13],
        ..Default::default()
    }
}

/// A successful output carrying [`sample_feature`].
pub fn sample_output() -> EngineOutput {
    EngineOutput {
        error_code: status::OK,
        features: vec![sample_feature()],
    }
}
