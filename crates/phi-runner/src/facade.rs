//! Runner facade.
//!
//! Owns the history behind a mutex that only the generation worker (for the
//! length of one turn) and the reset/snapshot calls ever lock. A busy flag
//! rejects a second turn or a reset while a turn is in flight.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::Stream;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use phi_context::{BudgetConfig, ConversationHistory};
use phi_core::{ChatError, Message, Result};
use phi_engine::{EngineLoader, InferenceEngine, SessionOptions, StreamingSession};
use phi_settings::PhiSettings;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lazy stream of assistant text fragments for one turn.
pub type FragmentStream = Pin<Box<dyn Stream<Item = String> + Send>>;

type LoadFuture = Shared<BoxFuture<'static, std::result::Result<Arc<dyn InferenceEngine>, ChatError>>>;

/// Runner configuration.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Generator parameters and template.
    pub session: SessionOptions,
    /// History budget.
    pub budget: BudgetConfig,
    /// System text used when a conversation starts without one.
    pub default_system_message: String,
    /// Fragments buffered between the worker and the stream.
    pub channel_capacity: usize,
}

impl RunnerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &PhiSettings) -> Self {
        Self {
            session: SessionOptions::from_settings(settings),
            budget: BudgetConfig::from_settings(&settings.context),
            default_system_message: settings.context.default_system_message.clone(),
            channel_capacity: settings.generation.channel_capacity,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from_settings(&PhiSettings::default())
    }
}

/// Clears the busy flag when dropped, including on worker panic.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Coordinates model loading, the conversation, and streaming turns.
pub struct RunnerFacade {
    loader: Arc<dyn EngineLoader>,
    loading: Mutex<Option<LoadFuture>>,
    engine: OnceLock<Arc<dyn InferenceEngine>>,
    ready_tx: watch::Sender<bool>,
    history: Arc<Mutex<ConversationHistory>>,
    busy: Arc<AtomicBool>,
    config: RunnerConfig,
}

impl RunnerFacade {
    /// Facade loading its engine through `loader`.
    pub fn new(loader: Arc<dyn EngineLoader>, config: RunnerConfig) -> Self {
        let history = ConversationHistory::new(&config.default_system_message, config.budget);
        let (ready_tx, _) = watch::channel(false);
        Self {
            loader,
            loading: Mutex::new(None),
            engine: OnceLock::new(),
            ready_tx,
            history: Arc::new(Mutex::new(history)),
            busy: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Facade configured from loaded settings.
    pub fn with_settings(loader: Arc<dyn EngineLoader>, settings: &PhiSettings) -> Self {
        Self::new(loader, RunnerConfig::from_settings(settings))
    }

    /// Active configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Load the engine.
    ///
    /// Idempotent. Concurrent callers share one load and all observe its
    /// result; after a failure the next call starts a fresh attempt. The
    /// readiness signal fires once, on the first success.
    pub async fn initialize(&self) -> Result<()> {
        if self.engine.get().is_some() {
            return Ok(());
        }

        let attempt = self.load_attempt();
        match attempt.clone().await {
            Ok(engine) => {
                if self.engine.set(engine).is_ok() {
                    let _ = self.ready_tx.send_replace(true);
                    info!("model loaded");
                }
                Ok(())
            }
            Err(error) => {
                let mut slot = self.loading.lock();
                if slot.as_ref().is_some_and(|current| current.ptr_eq(&attempt)) {
                    *slot = None;
                }
                warn!(%error, "model load failed");
                Err(error)
            }
        }
    }

    fn load_attempt(&self) -> LoadFuture {
        let mut slot = self.loading.lock();
        if let Some(attempt) = slot.as_ref() {
            return attempt.clone();
        }
        info!("loading model");
        let loader = Arc::clone(&self.loader);
        let attempt = async move { loader.load().await.map_err(ChatError::from) }
            .boxed()
            .shared();
        *slot = Some(attempt.clone());
        attempt
    }

    /// Whether a loaded engine reports itself usable.
    pub fn is_ready(&self) -> bool {
        self.engine.get().is_some_and(|engine| engine.is_ready())
    }

    /// Receiver that flips to `true` once the model is loaded.
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Wait until the model has been loaded.
    pub async fn wait_until_ready(&self) {
        let mut ready = self.ready_signal();
        // The sender lives as long as `self`, so this only ends on `true`.
        let _ = ready.wait_for(|loaded| *loaded).await;
    }

    /// Whether a turn is streaming.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Replace the conversation with a fresh one.
    ///
    /// A blank or missing `system_text` uses the configured default. Fails
    /// with [`ChatError::InvalidState`] while a turn is streaming.
    pub fn start_new_conversation(&self, system_text: Option<&str>) -> Result<()> {
        let _busy = BusyGuard::acquire(&self.busy)
            .ok_or_else(|| ChatError::invalid_state("cannot reset while a turn is streaming"))?;
        let system_text = system_text
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .unwrap_or(&self.config.default_system_message);
        self.history.lock().reset(system_text);
        info!("new conversation started");
        Ok(())
    }

    /// Copy of the current messages.
    ///
    /// Fails with [`ChatError::InvalidState`] while a turn holds the history.
    pub fn history_snapshot(&self) -> Result<Vec<Message>> {
        self.history
            .try_lock()
            .map(|history| history.messages().to_vec())
            .ok_or_else(|| ChatError::invalid_state("history is in use by a streaming turn"))
    }

    /// Submit a user message and stream the assistant reply.
    ///
    /// Blank input yields an empty stream and leaves the history alone.
    /// Cancelling `cancel` or dropping the stream stops generation; the
    /// fragments handed to the stream so far are still committed. The
    /// stream ends only after the reply has been committed.
    ///
    /// Must be called from within a Tokio runtime; otherwise fails with
    /// [`ChatError::InvalidState`].
    pub fn submit_user_turn(&self, text: &str, cancel: CancellationToken) -> Result<FragmentStream> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ChatError::invalid_state("no Tokio runtime to run the turn on"))?;
        let engine = self
            .engine
            .get()
            .filter(|engine| engine.is_ready())
            .cloned()
            .ok_or(ChatError::NotReady)?;

        if text.trim().is_empty() {
            debug!("blank user input ignored");
            return Ok(Box::pin(futures::stream::empty::<String>()));
        }

        let busy = BusyGuard::acquire(&self.busy)
            .ok_or_else(|| ChatError::invalid_state("a turn is already streaming"))?;

        let (tx, mut rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let turn_cancel = cancel.child_token();
        let turn = Turn {
            engine,
            history: Arc::clone(&self.history),
            text: text.to_string(),
            cancel: turn_cancel.clone(),
            options: self.config.session.clone(),
            tx,
            busy,
        };
        let _ = runtime.spawn_blocking(move || turn.run());

        let stream = async_stream::stream! {
            let _cancel_on_drop = turn_cancel.drop_guard();
            while let Some(fragment) = rx.recv().await {
                yield fragment;
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Everything the blocking worker needs for one turn.
struct Turn {
    engine: Arc<dyn InferenceEngine>,
    history: Arc<Mutex<ConversationHistory>>,
    text: String,
    cancel: CancellationToken,
    options: SessionOptions,
    tx: mpsc::Sender<String>,
    busy: BusyGuard,
}

impl Turn {
    fn run(self) {
        let Self {
            engine,
            history,
            text,
            cancel,
            options,
            tx,
            busy,
        } = self;

        {
            let mut history = history.lock();
            drive(engine.as_ref(), &mut history, &text, &cancel, options, &tx);
        }
        // history unlocked, then busy cleared, then the stream ends
        drop(busy);
        drop(tx);
    }
}

fn drive(
    engine: &dyn InferenceEngine,
    history: &mut ConversationHistory,
    text: &str,
    cancel: &CancellationToken,
    options: SessionOptions,
    tx: &mpsc::Sender<String>,
) {
    let mut session = match StreamingSession::generate(engine, history, text, cancel.clone(), options)
    {
        Ok(session) => session,
        Err(error) => {
            warn!(%error, "turn rejected");
            return;
        }
    };

    while let Some(fragment) = session.next() {
        if let Err(mpsc::error::SendError(undelivered)) = tx.blocking_send(fragment) {
            debug!("fragment stream dropped, cancelling turn");
            cancel.cancel();
            let _ = session.retract(&undelivered);
            break;
        }
    }

    let outcome = session.finish();
    info!(
        state = ?outcome.state,
        fragments = outcome.fragments,
        tokens = outcome.tokens_generated,
        committed = outcome.committed_text.is_some(),
        "turn finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_guard_is_exclusive_and_releases() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = BusyGuard::acquire(&flag).unwrap();
        assert!(BusyGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(!flag.load(Ordering::Acquire));
        assert!(BusyGuard::acquire(&flag).is_some());
    }

    #[test]
    fn submit_outside_runtime_is_invalid_state() {
        use phi_engine::{ScriptedEngine, ScriptedLoader};

        let facade = RunnerFacade::new(
            Arc::new(ScriptedLoader::new(ScriptedEngine::new(["x"]))),
            RunnerConfig::default(),
        );
        assert_matches::assert_matches!(
            facade.submit_user_turn("Hi", CancellationToken::new()).err(),
            Some(ChatError::InvalidState(_))
        );
    }

    #[test]
    fn config_from_settings() {
        let mut settings = PhiSettings::default();
        settings.context.max_context_tokens = 64;
        settings.context.default_system_message = "Hello.".to_string();
        settings.generation.channel_capacity = 4;

        let config = RunnerConfig::from_settings(&settings);
        assert_eq!(config.budget.max_context_tokens, 64);
        assert_eq!(config.default_system_message, "Hello.");
        assert_eq!(config.channel_capacity, 4);
        assert_eq!(config.session.params.max_length, 1024);
    }
}
