//! Scripted engine for tests and offline demos.
//!
//! [`ScriptedEngine`] replays a fixed list of raw fragments, one per step.
//! Token ids are fragment indices, so the decoder is a table lookup.
//! Failures, readiness, and per-step delays can be injected.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::engine::{EngineLoader, GeneratorParams, InferenceEngine, TokenDecoder, TokenGenerator};
use crate::errors::{EngineError, Result};

type StepHook = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct Script {
    fragments: Vec<String>,
    fail_encode: bool,
    fail_step_at: Option<usize>,
    fail_decode_at: Option<usize>,
    step_delay: Option<Duration>,
    on_step: Option<StepHook>,
    ready: AtomicBool,
    steps: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
}

/// Deterministic engine replaying raw fragments.
#[derive(Clone)]
pub struct ScriptedEngine {
    script: Arc<Script>,
}

impl ScriptedEngine {
    /// Engine that emits `fragments` in order, then reports done.
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let script = Script {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ready: AtomicBool::new(true),
            ..Script::default()
        };
        Self {
            script: Arc::new(script),
        }
    }

    fn configure(mut self, f: impl FnOnce(&mut Script)) -> Self {
        // Builders run before the engine is shared.
        if let Some(script) = Arc::get_mut(&mut self.script) {
            f(script);
        }
        self
    }

    /// Make `encode` fail.
    #[must_use]
    pub fn failing_encode(self) -> Self {
        self.configure(|s| s.fail_encode = true)
    }

    /// Make the step producing fragment `index` fail.
    #[must_use]
    pub fn failing_step_at(self, index: usize) -> Self {
        self.configure(|s| s.fail_step_at = Some(index))
    }

    /// Make decoding fragment `index` fail.
    #[must_use]
    pub fn failing_decode_at(self, index: usize) -> Self {
        self.configure(|s| s.fail_decode_at = Some(index))
    }

    /// Sleep before every step.
    #[must_use]
    pub fn with_step_delay(self, delay: Duration) -> Self {
        self.configure(|s| s.step_delay = Some(delay))
    }

    /// Call `hook` with the fragment index before every step.
    #[must_use]
    pub fn with_step_hook(self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.configure(|s| s.on_step = Some(Arc::new(hook)))
    }

    /// Toggle readiness.
    pub fn set_ready(&self, ready: bool) {
        self.script.ready.store(ready, Ordering::SeqCst);
    }

    /// Prompt passed to the latest `encode` call.
    pub fn last_prompt(&self) -> Option<String> {
        self.script.last_prompt.lock().clone()
    }

    /// Total steps taken across all generators.
    pub fn steps_taken(&self) -> usize {
        self.script.steps.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for ScriptedEngine {
    fn is_ready(&self) -> bool {
        self.script.ready.load(Ordering::SeqCst)
    }

    fn encode(&self, prompt: &str) -> Result<Vec<u32>> {
        *self.script.last_prompt.lock() = Some(prompt.to_string());
        if self.script.fail_encode {
            return Err(EngineError::Inference("scripted encode failure".into()));
        }
        // One token per whitespace-separated word, at least one.
        let words = prompt.split_whitespace().count().max(1);
        Ok(vec![0; words])
    }

    fn create_generator(&self, params: &GeneratorParams) -> Result<Box<dyn TokenGenerator>> {
        Ok(Box::new(ScriptedGenerator {
            script: Arc::clone(&self.script),
            max_length: params.max_length,
            sequence_len: 0,
            position: 0,
            last: None,
        }))
    }

    fn create_decoder(&self) -> Result<Box<dyn TokenDecoder>> {
        Ok(Box::new(ScriptedDecoder {
            script: Arc::clone(&self.script),
        }))
    }
}

struct ScriptedGenerator {
    script: Arc<Script>,
    max_length: usize,
    sequence_len: usize,
    position: usize,
    last: Option<u32>,
}

impl TokenGenerator for ScriptedGenerator {
    fn append_tokens(&mut self, tokens: &[u32]) -> Result<()> {
        self.sequence_len += tokens.len();
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.position >= self.script.fragments.len() || self.sequence_len >= self.max_length
    }

    fn step(&mut self) -> Result<()> {
        if let Some(hook) = &self.script.on_step {
            hook(self.position);
        }
        if let Some(delay) = self.script.step_delay {
            std::thread::sleep(delay);
        }
        if self.script.fail_step_at == Some(self.position) {
            return Err(EngineError::Inference(format!(
                "scripted step failure at {}",
                self.position
            )));
        }
        let id = u32::try_from(self.position)
            .map_err(|_| EngineError::Internal("script too long".into()))?;
        self.last = Some(id);
        self.position += 1;
        self.sequence_len += 1;
        let _ = self.script.steps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn last_token(&self) -> Result<u32> {
        self.last
            .ok_or_else(|| EngineError::Inference("no token generated yet".into()))
    }
}

struct ScriptedDecoder {
    script: Arc<Script>,
}

impl TokenDecoder for ScriptedDecoder {
    fn decode(&mut self, token: u32) -> Result<String> {
        let index = token as usize;
        if self.script.fail_decode_at == Some(index) {
            return Err(EngineError::Inference(format!(
                "scripted decode failure at {index}"
            )));
        }
        self.script
            .fragments
            .get(index)
            .cloned()
            .ok_or_else(|| EngineError::Inference(format!("unknown token {token}")))
    }
}

/// Loader handing out a shared [`ScriptedEngine`], counting loads.
pub struct ScriptedLoader {
    engine: ScriptedEngine,
    delay: Option<Duration>,
    failures_left: AtomicUsize,
    loads: AtomicUsize,
}

impl ScriptedLoader {
    /// Loader that returns `engine` on every load.
    pub fn new(engine: ScriptedEngine) -> Self {
        Self {
            engine,
            delay: None,
            failures_left: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
        }
    }

    /// Sleep (on the async clock) before each load completes.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `count` loads with [`EngineError::ModelInit`].
    #[must_use]
    pub fn failing_first(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Number of `load` calls so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// The engine handed out by `load`.
    pub fn engine(&self) -> &ScriptedEngine {
        &self.engine
    }
}

#[async_trait]
impl EngineLoader for ScriptedLoader {
    async fn load(&self) -> Result<Arc<dyn InferenceEngine>> {
        let attempt = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(attempt, "loading scripted engine");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EngineError::ModelInit(format!(
                "scripted load failure on attempt {attempt}"
            )));
        }
        Ok(Arc::new(self.engine.clone()))
    }
}
