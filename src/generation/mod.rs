//! One request/response cycle against the generation backend.
//!
//! A [`GenerationSession`] runs at most one turn at a time. A turn builds the
//! prompt from the shared conversation, streams the backend response while
//! reporting progress, and appends the finished assistant message. Failed
//! turns append nothing.

pub mod events;

pub use events::{NoopObserver, TurnEvent, TurnId, TurnObserver, TurnState};

use crate::config::SessionConfig;
use crate::conversation::{Message, MessageMetadata, SharedConversation, estimate_tokens};
use crate::error::{ApiError, Result};
use crate::observability::SPAN_GENERATION_TURN;
use crate::transport::GenerationBackend;
use crate::transport::types::{GenerateChunk, GenerateOptions, GenerateRequest};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

/// Session configuration shared with the orchestrator.
pub type SharedSessionConfig = Arc<RwLock<SessionConfig>>;

#[derive(Debug, Default)]
struct TurnSlot {
    state: TurnState,
    active: Option<ActiveTurn>,
}

#[derive(Debug)]
struct ActiveTurn {
    id: TurnId,
    cancel: CancellationToken,
}

/// Drives generation turns.
pub struct GenerationSession {
    backend: Arc<dyn GenerationBackend>,
    store: SharedConversation,
    config: SharedSessionConfig,
    observer: Arc<dyn TurnObserver>,
    slot: Mutex<TurnSlot>,
}

impl GenerationSession {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        store: SharedConversation,
        config: SharedSessionConfig,
        observer: Arc<dyn TurnObserver>,
    ) -> Self {
        Self {
            backend,
            store,
            config,
            observer,
            slot: Mutex::new(TurnSlot::default()),
        }
    }

    pub fn state(&self) -> TurnState {
        self.lock_slot().state
    }

    /// Id of the turn in flight, if any.
    pub fn active_turn(&self) -> Option<TurnId> {
        self.lock_slot().active.as_ref().map(|a| a.id)
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Cancel the turn in flight. Returns whether there was one.
    pub fn cancel(&self) -> bool {
        match &self.lock_slot().active {
            Some(active) => {
                info!(turn_id = %active.id, "cancelling turn");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the turn in flight and return to `Idle` at once, without
    /// waiting for it to unwind. The abandoned turn still emits its
    /// `Failed` event but no longer owns the session state.
    pub fn abandon(&self) -> bool {
        let mut slot = self.lock_slot();
        slot.state = TurnState::Idle;
        match slot.active.take() {
            Some(active) => {
                info!(turn_id = %active.id, "abandoning turn");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Return a finished session to `Idle`.
    pub fn reset(&self) {
        let mut slot = self.lock_slot();
        if !slot.state.is_active() {
            slot.state = TurnState::Idle;
        }
    }

    /// Run one turn to completion.
    ///
    /// Returns `Ok(None)` without doing anything when a turn is already in
    /// flight.
    ///
    /// # Errors
    ///
    /// Returns the transport failure, [`ApiError::InvalidResponse`] when the
    /// stream ends without a final chunk, or [`ApiError::Cancelled`].
    pub async fn start_turn(&self) -> Result<Option<Message>> {
        let Some((turn_id, cancel)) = self.begin() else {
            debug!("turn already in flight, ignoring start");
            return Ok(None);
        };
        let mut guard = TurnGuard {
            session: self,
            turn_id,
            finished: false,
        };
        self.observer.on_event(&TurnEvent::Started { turn_id });

        let config = self
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let span = info_span!(SPAN_GENERATION_TURN, turn_id = %turn_id, model = %config.model_name);
        let result = self
            .run_turn(turn_id, &config, &cancel)
            .instrument(span)
            .await;

        guard.finished = true;
        match result {
            Ok(message) => {
                self.finish(turn_id, TurnState::Completed);
                info!(turn_id = %turn_id, message_id = %message.id, "turn completed");
                self.observer.on_event(&TurnEvent::Completed {
                    turn_id,
                    message: message.clone(),
                });
                Ok(Some(message))
            }
            Err(err) => {
                if !self.finish(turn_id, TurnState::Failed) {
                    debug!(turn_id = %turn_id, "abandoned turn unwound");
                } else if err.is_cancelled() {
                    info!(turn_id = %turn_id, "turn cancelled");
                } else {
                    error!(turn_id = %turn_id, error = %err, "turn failed");
                }
                self.observer.on_event(&TurnEvent::Failed {
                    turn_id,
                    error: err.clone(),
                });
                Err(err)
            }
        }
    }

    async fn run_turn(
        &self,
        turn_id: TurnId,
        config: &SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let (prompt, epoch) = {
            let store = self.store.read().unwrap_or_else(|e| e.into_inner());
            (store.build_prompt(config), store.epoch())
        };
        let request = GenerateRequest {
            model: config.model_name.clone(),
            prompt,
            stream: true,
            options: GenerateOptions {
                temperature: config.temperature,
                num_predict: config.max_output_tokens,
            },
        };

        let started = Instant::now();
        let mut content = String::new();
        let last = {
            let mut on_chunk = |chunk: &GenerateChunk| {
                if chunk.response.is_empty() {
                    return;
                }
                content.push_str(&chunk.response);
                self.mark_streaming();
                self.observer.on_event(&TurnEvent::Progress {
                    turn_id,
                    fragment: chunk.response.clone(),
                    content: content.clone(),
                });
            };
            self.backend.generate(&request, cancel, &mut on_chunk).await?
        };

        let model_name = if last.model.is_empty() {
            config.model_name.clone()
        } else {
            last.model
        };
        let metadata = MessageMetadata {
            model_name: Some(model_name),
            duration_seconds: Some(rounded_seconds(started.elapsed())),
            estimated_tokens: Some(estimate_tokens(&content)),
        };

        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        if store.epoch() != epoch {
            return Err(ApiError::Cancelled(
                "conversation was cleared during generation".to_owned(),
            ));
        }
        Ok(store.append_assistant(content, metadata))
    }

    fn begin(&self) -> Option<(TurnId, CancellationToken)> {
        let mut slot = self.lock_slot();
        if slot.state.is_active() {
            return None;
        }
        let id = TurnId::new();
        let cancel = CancellationToken::new();
        slot.state = TurnState::Starting;
        slot.active = Some(ActiveTurn {
            id,
            cancel: cancel.clone(),
        });
        Some((id, cancel))
    }

    fn mark_streaming(&self) {
        let mut slot = self.lock_slot();
        if slot.state == TurnState::Starting {
            slot.state = TurnState::Streaming;
        }
    }

    /// Settle `turn_id` in `state`. Returns false when the turn no longer
    /// owns the session.
    fn finish(&self, turn_id: TurnId, state: TurnState) -> bool {
        let mut slot = self.lock_slot();
        if slot.active.as_ref().is_none_or(|a| a.id != turn_id) {
            return false;
        }
        slot.state = state;
        slot.active = None;
        true
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, TurnSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fails the turn if the driving future is dropped mid-flight.
struct TurnGuard<'a> {
    session: &'a GenerationSession,
    turn_id: TurnId,
    finished: bool,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.session.finish(self.turn_id, TurnState::Failed);
        debug!(turn_id = %self.turn_id, "turn dropped before completion");
        self.session.observer.on_event(&TurnEvent::Failed {
            turn_id: self.turn_id,
            error: ApiError::Cancelled("turn dropped before completion".to_owned()),
        });
    }
}

fn rounded_seconds(elapsed: Duration) -> u64 {
    u64::try_from((elapsed.as_millis() + 500) / 1000).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationStore, Role};
    use crate::transport::ChunkSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct ScriptedBackend {
        chunks: Vec<GenerateChunk>,
        failure: Option<ApiError>,
        gate: Option<Arc<Notify>>,
        calls: AtomicU32,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn generate(
            &self,
            request: &GenerateRequest,
            cancel: &CancellationToken,
            on_chunk: ChunkSink<'_>,
        ) -> Result<GenerateChunk> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request.prompt.clone());
            if let Some(gate) = &self.gate {
                tokio::select! {
                    () = gate.notified() => {}
                    () = cancel.cancelled() => return Err(ApiError::Cancelled("cancelled".into())),
                }
            }
            let mut last = None;
            for chunk in &self.chunks {
                on_chunk(chunk);
                last = Some(chunk.clone());
            }
            if let Some(err) = &self.failure {
                return Err(err.clone());
            }
            last.ok_or_else(|| ApiError::invalid_response("no chunks"))
        }
    }

    struct Recorder(Mutex<Vec<TurnEvent>>);

    impl TurnObserver for Recorder {
        fn on_event(&self, event: &TurnEvent) {
            self.0.lock().unwrap_or_else(|e| e.into_inner()).push(event.clone());
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<TurnEvent> {
            self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    fn session(backend: Arc<ScriptedBackend>) -> (Arc<GenerationSession>, SharedConversation, Arc<Recorder>) {
        let store = ConversationStore::shared();
        let config = Arc::new(RwLock::new(SessionConfig {
            model_name: "test-model".into(),
            temperature: 0.7,
            ..SessionConfig::default()
        }));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let session = Arc::new(GenerationSession::new(
            backend,
            Arc::clone(&store),
            config,
            recorder.clone(),
        ));
        (session, store, recorder)
    }

    fn hi_there() -> Vec<GenerateChunk> {
        vec![
            GenerateChunk::fragment("Hi"),
            GenerateChunk::fragment(" there"),
            GenerateChunk::last("!"),
        ]
    }

    #[tokio::test]
    async fn successful_turn_appends_concatenated_message() {
        let backend = Arc::new(ScriptedBackend {
            chunks: hi_there(),
            ..ScriptedBackend::default()
        });
        let (session, store, recorder) = session(backend);
        store
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .append_user("Hello");

        let message = session
            .start_turn()
            .await
            .unwrap_or_else(|e| panic!("turn failed: {e}"))
            .unwrap_or_else(|| panic!("turn was skipped"));

        assert_eq!(message.content, "Hi there!");
        assert_eq!(message.role, Role::Assistant);
        let meta = message.metadata.clone().unwrap_or_else(|| panic!("no metadata"));
        assert_eq!(meta.estimated_tokens, Some(3));
        assert_eq!(meta.model_name.as_deref(), Some("test-model"));
        assert_eq!(session.state(), TurnState::Completed);

        let history = store.read().unwrap_or_else(|e| e.into_inner()).history().to_vec();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1], message);

        let progress: Vec<String> = recorder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                TurnEvent::Progress { content, .. } => Some(content),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec!["Hi", "Hi there", "Hi there!"]);

        let events = recorder.events();
        assert!(matches!(events.first(), Some(TurnEvent::Started { .. })));
        assert!(matches!(events.last(), Some(TurnEvent::Completed { .. })));
        let turn_id = events[0].turn_id();
        assert!(events.iter().all(|e| e.turn_id() == turn_id));
    }

    #[tokio::test]
    async fn empty_fragments_emit_no_progress() {
        let backend = Arc::new(ScriptedBackend {
            chunks: vec![
                GenerateChunk::fragment(""),
                GenerateChunk::fragment("A"),
                GenerateChunk::last(""),
            ],
            ..ScriptedBackend::default()
        });
        let (session, _store, recorder) = session(backend);
        let message = session.start_turn().await.ok().flatten();
        assert_eq!(message.map(|m| m.content).as_deref(), Some("A"));
        let progress = recorder
            .events()
            .iter()
            .filter(|e| matches!(e, TurnEvent::Progress { .. }))
            .count();
        assert_eq!(progress, 1);
    }

    #[tokio::test]
    async fn failed_turn_appends_nothing() {
        let backend = Arc::new(ScriptedBackend {
            chunks: vec![GenerateChunk::fragment("partial")],
            failure: Some(ApiError::from_status(404, "")),
            ..ScriptedBackend::default()
        });
        let (session, store, recorder) = session(backend);
        store
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .append_user("Hello");

        let err = session.start_turn().await.err();
        assert_eq!(err.and_then(|e| e.status()), Some(404));
        assert_eq!(session.state(), TurnState::Failed);
        assert_eq!(store.read().unwrap_or_else(|e| e.into_inner()).len(), 1);
        assert!(matches!(recorder.events().last(), Some(TurnEvent::Failed { .. })));
        assert!(session.active_turn().is_none());
    }

    #[tokio::test]
    async fn start_while_active_is_noop() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend {
            chunks: hi_there(),
            gate: Some(Arc::clone(&gate)),
            ..ScriptedBackend::default()
        });
        let (session, store, _recorder) = session(Arc::clone(&backend));

        let running = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start_turn().await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let active = session.active_turn();
        assert!(active.is_some());

        let second = session.start_turn().await;
        assert!(matches!(second, Ok(None)));
        assert_eq!(session.active_turn(), active);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(store.read().unwrap_or_else(|e| e.into_inner()).is_empty());

        gate.notify_one();
        let first = running.await.unwrap_or_else(|e| panic!("join failed: {e}"));
        assert!(matches!(first, Ok(Some(_))));
    }

    #[tokio::test]
    async fn turn_is_reentrant_after_completion_and_failure() {
        let backend = Arc::new(ScriptedBackend {
            chunks: hi_there(),
            ..ScriptedBackend::default()
        });
        let (session, store, _recorder) = session(Arc::clone(&backend));
        assert!(session.start_turn().await.is_ok());
        assert!(session.start_turn().await.is_ok());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.read().unwrap_or_else(|e| e.into_inner()).len(), 2);

        let prompts = backend.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone();
        assert!(prompts[1].contains("Interviewer: Hi there!"));
    }

    #[tokio::test]
    async fn cancel_fails_turn_with_cancelled() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend {
            chunks: hi_there(),
            gate: Some(gate),
            ..ScriptedBackend::default()
        });
        let (session, store, _recorder) = session(Arc::clone(&backend));

        let running = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start_turn().await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(session.cancel());

        let result = running.await.unwrap_or_else(|e| panic!("join failed: {e}"));
        assert!(result.is_err_and(|e| e.is_cancelled()));
        assert_eq!(session.state(), TurnState::Failed);
        assert!(store.read().unwrap_or_else(|e| e.into_inner()).is_empty());
        assert!(!session.cancel());
    }

    #[tokio::test]
    async fn clearing_history_mid_turn_discards_result() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend {
            chunks: hi_there(),
            gate: Some(Arc::clone(&gate)),
            ..ScriptedBackend::default()
        });
        let (session, store, _recorder) = session(Arc::clone(&backend));

        let running = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start_turn().await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        store.write().unwrap_or_else(|e| e.into_inner()).clear();
        gate.notify_one();

        let result = running.await.unwrap_or_else(|e| panic!("join failed: {e}"));
        assert!(result.is_err_and(|e| e.is_cancelled()));
        assert!(store.read().unwrap_or_else(|e| e.into_inner()).is_empty());
    }

    #[tokio::test]
    async fn dropped_turn_does_not_wedge_session() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend {
            chunks: hi_there(),
            gate: Some(gate),
            ..ScriptedBackend::default()
        });
        let (session, _store, recorder) = session(Arc::clone(&backend));

        let running = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start_turn().await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        running.abort();
        let _ = running.await;

        assert_eq!(session.state(), TurnState::Failed);
        assert!(matches!(
            recorder.events().last(),
            Some(TurnEvent::Failed { error, .. }) if error.is_cancelled()
        ));
        session.reset();
        assert_eq!(session.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn abandon_returns_to_idle_before_turn_unwinds() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend {
            chunks: hi_there(),
            gate: Some(Arc::clone(&gate)),
            ..ScriptedBackend::default()
        });
        let (session, store, recorder) = session(Arc::clone(&backend));

        let running = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start_turn().await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let abandoned = session.active_turn();

        assert!(session.abandon());
        assert_eq!(session.state(), TurnState::Idle);
        assert!(!session.is_active());

        let result = running.await.unwrap_or_else(|e| panic!("join failed: {e}"));
        assert!(result.is_err_and(|e| e.is_cancelled()));
        assert_eq!(session.state(), TurnState::Idle);
        assert!(store.read().unwrap_or_else(|e| e.into_inner()).is_empty());
        assert_eq!(recorder.events().last().map(TurnEvent::turn_id), abandoned);

        gate.notify_one();
        assert!(matches!(session.start_turn().await, Ok(Some(_))));
        assert_eq!(session.state(), TurnState::Completed);
    }

    #[tokio::test]
    async fn abandon_when_idle_resets_finished_state() {
        let backend = Arc::new(ScriptedBackend {
            failure: Some(ApiError::from_status(500, "")),
            ..ScriptedBackend::default()
        });
        let (session, _store, _recorder) = session(backend);
        assert!(session.start_turn().await.is_err());
        assert_eq!(session.state(), TurnState::Failed);
        assert!(!session.abandon());
        assert_eq!(session.state(), TurnState::Idle);
    }

    #[test]
    fn seconds_round_half_up() {
        assert_eq!(rounded_seconds(Duration::from_millis(499)), 0);
        assert_eq!(rounded_seconds(Duration::from_millis(1500)), 2);
    }
}
