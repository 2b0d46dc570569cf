//! The single surface a UI drives: conversation, generation, and speech.
//!
//! [`ChatOrchestrator`] is a cheap `Clone` handle. Views can be read from
//! any clone while [`ChatOrchestrator::send_message`] is awaiting a turn.

use crate::config::{AppConfig, SessionConfig, SessionConfigUpdate, SpeechSettings};
use crate::conversation::{
    ConversationStore, Message, MessageId, SharedConversation, Speaker, TranscriptEntry,
};
use crate::error::{ApiError, Result};
use crate::generation::{
    GenerationSession, SharedSessionConfig, TurnEvent, TurnId, TurnObserver, TurnState,
};
use crate::speech::{
    AudioOutput, NullAudioOutput, PlaybackStatus, ProcessAudioOutput, SpeechEvent,
    SpeechObserver, SpeechPipeline,
};
use crate::transport::types::ModelInfo;
use crate::transport::{GenerationBackend, HttpTransport, SpeechSynthesisClient};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// System notice recorded when the interview starts.
pub const JOINED_NOTICE: &str = "Candidate has joined the interview session";

const EVENT_CAPACITY: usize = 256;

/// Everything the orchestrator reports to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Turn(TurnEvent),
    Speech(SpeechEvent),
    /// The conversation was cleared.
    Cleared,
}

/// Assistant text still being generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamingTurn {
    pub turn_id: TurnId,
    pub content: String,
}

/// Serializable copy of every view, for handing to a UI.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSnapshot {
    pub messages: Vec<Message>,
    pub streaming: Option<StreamingTurn>,
    pub is_generating: bool,
    pub error: Option<String>,
    pub speech_error: Option<String>,
    pub playback: PlaybackStatus,
}

#[derive(Debug, Default)]
struct ViewState {
    streaming: Option<StreamingTurn>,
    generation_error: Option<ApiError>,
    /// Most recent failure from generation or speech.
    last_failure: Option<ApiError>,
}

/// Folds turn and speech events into the view and rebroadcasts them.
struct ViewSink {
    view: Mutex<ViewState>,
    events: broadcast::Sender<ChatEvent>,
}

impl ViewSink {
    fn lock(&self) -> std::sync::MutexGuard<'_, ViewState> {
        self.view.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl TurnObserver for ViewSink {
    fn on_event(&self, event: &TurnEvent) {
        {
            let mut view = self.lock();
            match event {
                TurnEvent::Started { turn_id } => {
                    view.streaming = Some(StreamingTurn {
                        turn_id: *turn_id,
                        content: String::new(),
                    });
                }
                TurnEvent::Progress {
                    turn_id, content, ..
                } => {
                    if let Some(streaming) = view
                        .streaming
                        .as_mut()
                        .filter(|s| s.turn_id == *turn_id)
                    {
                        streaming.content.clone_from(content);
                    }
                }
                TurnEvent::Completed { turn_id, .. } | TurnEvent::Failed { turn_id, .. } => {
                    if view.streaming.as_ref().is_some_and(|s| s.turn_id == *turn_id) {
                        view.streaming = None;
                    }
                    if let TurnEvent::Failed { error, .. } = event {
                        if !error.is_cancelled() {
                            view.generation_error = Some(error.clone());
                            view.last_failure = Some(error.clone());
                        }
                    }
                }
            }
        }
        self.publish(ChatEvent::Turn(event.clone()));
    }
}

impl SpeechObserver for ViewSink {
    fn on_event(&self, event: &SpeechEvent) {
        if let SpeechEvent::Failed { error, .. } = event {
            self.lock().last_failure = Some(error.clone());
        }
        self.publish(ChatEvent::Speech(event.clone()));
    }
}

struct Inner {
    store: SharedConversation,
    config: SharedSessionConfig,
    backend: Arc<dyn GenerationBackend>,
    generation: GenerationSession,
    speech: SpeechPipeline,
    sink: Arc<ViewSink>,
    /// Ticket of the send in progress, zero when none.
    sending: AtomicU64,
    next_send: AtomicU64,
    /// Cancelled by `clear_chat` so queued auto-speech never starts.
    speech_session: Mutex<CancellationToken>,
    initialized: AtomicBool,
    auto_speak: AtomicBool,
    tasks: TaskTracker,
}

/// Public surface of the interview core.
#[derive(Clone)]
pub struct ChatOrchestrator {
    inner: Arc<Inner>,
}

/// Releases the send reservation when a turn ends or is dropped, unless
/// `clear_chat` already released it.
struct SendingGuard<'a> {
    slot: &'a AtomicU64,
    ticket: u64,
}

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .slot
            .compare_exchange(self.ticket, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

impl ChatOrchestrator {
    /// Wire an orchestrator from its collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Config`] when the session or speech settings are invalid.
    pub fn new(
        config: &AppConfig,
        backend: Arc<dyn GenerationBackend>,
        speech_client: Arc<dyn SpeechSynthesisClient>,
        output: Arc<dyn AudioOutput>,
    ) -> Result<Self> {
        config.session.validate()?;
        config.speech.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let sink = Arc::new(ViewSink {
            view: Mutex::new(ViewState::default()),
            events,
        });
        let store = ConversationStore::shared();
        let session_config = Arc::new(RwLock::new(config.session.clone()));
        let generation = GenerationSession::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            Arc::clone(&session_config),
            sink.clone(),
        );
        let speech = SpeechPipeline::new(
            speech_client,
            output,
            config.speech.clone(),
            sink.clone(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config: session_config,
                backend,
                generation,
                speech,
                sink,
                sending: AtomicU64::new(0),
                next_send: AtomicU64::new(1),
                speech_session: Mutex::new(CancellationToken::new()),
                initialized: AtomicBool::new(false),
                auto_speak: AtomicBool::new(config.speech.auto_speak),
                tasks: TaskTracker::new(),
            }),
        })
    }

    /// Orchestrator talking HTTP to the configured backend and playing audio
    /// through a local player, or silently when none is installed.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Config`] for invalid configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(&config.backend)?);
        let output: Arc<dyn AudioOutput> = match ProcessAudioOutput::discover(&config.playback) {
            Ok(player) => Arc::new(player),
            Err(e) => {
                warn!(error = %e, "audio playback disabled");
                Arc::new(NullAudioOutput)
            }
        };
        Self::new(config, transport.clone(), transport, output)
    }

    /// Greet the candidate once: record the joined notice and run the first
    /// turn. Does nothing when already initialized or when history exists.
    pub async fn initialize(&self) -> Option<Message> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return None;
        }
        let Some(_guard) = self.reserve() else {
            debug!("turn in flight, skipping greeting");
            return None;
        };
        {
            let mut store = self.write_store();
            if !store.is_empty() {
                return None;
            }
            store.append_system(JOINED_NOTICE);
        }
        info!("starting interview greeting");
        self.run_turn().await
    }

    /// Append `text` as the candidate's turn and wait for the reply.
    ///
    /// Ignored with a warning while a turn is generating or when `text` is
    /// blank. Generation failures are stored in [`Self::error`], not returned.
    pub async fn send_message(&self, text: &str) -> Option<Message> {
        if text.trim().is_empty() {
            warn!("ignoring empty message");
            return None;
        }
        let Some(_guard) = self.reserve() else {
            warn!("already generating a response, ignoring duplicate send");
            return None;
        };
        self.clear_generation_error();
        self.write_store().append_user(text);
        self.run_turn().await
    }

    fn reserve(&self) -> Option<SendingGuard<'_>> {
        if self.inner.generation.is_active() {
            return None;
        }
        let ticket = self.inner.next_send.fetch_add(1, Ordering::SeqCst);
        self.inner
            .sending
            .compare_exchange(0, ticket, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SendingGuard {
                slot: &self.inner.sending,
                ticket,
            })
    }

    async fn run_turn(&self) -> Option<Message> {
        match self.inner.generation.start_turn().await {
            Ok(Some(message)) => {
                self.schedule_speech(&message);
                Some(message)
            }
            Ok(None) => None,
            Err(err) => {
                debug!(error = %err, "turn ended without a message");
                None
            }
        }
    }

    fn schedule_speech(&self, message: &Message) {
        if !self.inner.auto_speak.load(Ordering::SeqCst) || message.content.trim().is_empty() {
            return;
        }
        let this = self.clone();
        let id = message.id.clone();
        let text = message.content.clone();
        let session = self.speech_session();
        self.inner.tasks.spawn(async move {
            match this.inner.speech.play_if_idle(&id, &text, &session).await {
                Ok(true) => debug!(message_id = %id, "auto-playing reply"),
                Ok(false) => debug!(message_id = %id, "reply not played"),
                Err(e) => debug!(message_id = %id, error = %e, "auto speech failed"),
            }
        });
    }

    fn speech_session(&self) -> CancellationToken {
        self.inner
            .speech_session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cancel any turn, stop audio, and empty the history. Cached speech is kept.
    ///
    /// The turn state is `Idle` on return and a new message can be sent
    /// immediately, even while the cancelled turn is still unwinding.
    pub fn clear_chat(&self) {
        let previous = std::mem::replace(
            &mut *self
                .inner
                .speech_session
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            CancellationToken::new(),
        );
        previous.cancel();
        self.inner.generation.abandon();
        self.inner.sending.store(0, Ordering::SeqCst);
        self.inner.speech.stop();
        self.write_store().clear();
        {
            let mut view = self.inner.sink.lock();
            view.streaming = None;
            view.generation_error = None;
            view.last_failure = None;
        }
        self.inner.sink.publish(ChatEvent::Cleared);
        info!("conversation cleared");
    }

    /// Merge `update` into the session configuration. History is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Config`] when the result is out of range; the
    /// previous configuration stays in effect.
    pub fn update_config(&self, update: &SessionConfigUpdate) -> Result<()> {
        let mut config = self.inner.config.write().unwrap_or_else(|e| e.into_inner());
        *config = config.merged(update)?;
        info!(model = %config.model_name, temperature = config.temperature, "session config updated");
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        self.inner
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// # Errors
    ///
    /// Returns [`ApiError::Config`] for unsupported voice parameters.
    pub fn update_speech_settings(&self, settings: SpeechSettings) -> Result<()> {
        self.inner
            .auto_speak
            .store(settings.auto_speak, Ordering::SeqCst);
        self.inner.speech.update_settings(settings)
    }

    pub fn set_auto_speak(&self, enabled: bool) {
        self.inner.auto_speak.store(enabled, Ordering::SeqCst);
    }

    /// Finalized messages in order.
    pub fn messages(&self) -> Vec<Message> {
        self.read_store().history().to_vec()
    }

    pub fn streaming(&self) -> Option<StreamingTurn> {
        self.inner.sink.lock().streaming.clone()
    }

    pub fn is_generating(&self) -> bool {
        self.inner.sending.load(Ordering::SeqCst) != 0 || self.inner.generation.is_active()
    }

    pub fn turn_state(&self) -> TurnState {
        self.inner.generation.state()
    }

    /// Most recent failure from generation or speech.
    pub fn error(&self) -> Option<ApiError> {
        self.inner.sink.lock().last_failure.clone()
    }

    /// Most recent generation failure.
    pub fn generation_error(&self) -> Option<ApiError> {
        self.inner.sink.lock().generation_error.clone()
    }

    /// Most recent speech failure, kept apart from the conversation.
    pub fn speech_error(&self) -> Option<ApiError> {
        self.inner.speech.last_error()
    }

    pub fn clear_speech_error(&self) {
        self.inner.speech.clear_error();
    }

    fn clear_generation_error(&self) {
        let mut view = self.inner.sink.lock();
        view.generation_error = None;
        view.last_failure = None;
    }

    pub fn playback_status(&self) -> PlaybackStatus {
        self.inner.speech.status()
    }

    /// Play the audio for a finalized message, synthesizing it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] for an unknown id, or the speech
    /// failure (also recorded in [`Self::speech_error`]).
    pub async fn play_speech(&self, id: &MessageId) -> Result<()> {
        let text = self
            .read_store()
            .get(id)
            .map(|m| m.content.clone())
            .ok_or_else(|| ApiError::InvalidRequest(format!("unknown message {id}")))?;
        self.inner.speech.play(id, &text).await
    }

    pub fn stop_speech(&self) {
        self.inner.speech.stop();
    }

    /// Pause the current utterance. Returns whether anything was paused.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Playback`] when the output cannot pause.
    pub fn pause_speech(&self) -> Result<bool> {
        self.inner.speech.pause()
    }

    /// Resume a paused utterance. Returns whether anything was resumed.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Playback`] when the output cannot resume.
    pub fn resume_speech(&self) -> Result<bool> {
        self.inner.speech.resume()
    }

    /// Forget every cached clip.
    pub fn clear_speech_cache(&self) {
        self.inner.speech.clear_cache();
    }

    /// Transcript lines, including the reply still being generated.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        let mut entries = self.read_store().transcript();
        if let Some(streaming) = self.streaming() {
            entries.push(TranscriptEntry {
                id: streaming.turn_id.to_string(),
                speaker: Speaker::AiInterviewer,
                text: streaming.content,
                timestamp: Utc::now(),
                duration_seconds: None,
            });
        }
        entries
    }

    /// Replace the history with `entries` behind the configured system prompt.
    pub fn update_from_transcript(&self, entries: &[TranscriptEntry]) {
        self.inner.generation.cancel();
        let system_prompt = self.session_config().system_prompt;
        self.write_store()
            .replace_from_transcript(entries, &system_prompt);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.sink.events.subscribe()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            messages: self.messages(),
            streaming: self.streaming(),
            is_generating: self.is_generating(),
            error: self.error().map(|e| e.message().to_owned()),
            speech_error: self.speech_error().map(|e| e.message().to_owned()),
            playback: self.playback_status(),
        }
    }

    pub async fn health_check(&self) -> bool {
        self.inner.backend.health_check().await
    }

    /// # Errors
    ///
    /// Returns the transport failure.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        self.inner
            .backend
            .list_models(&CancellationToken::new())
            .await
    }

    /// Wait for background speech work started so far.
    pub async fn wait_for_background_tasks(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    fn read_store(&self) -> std::sync::RwLockReadGuard<'_, ConversationStore> {
        self.inner.store.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_store(&self) -> std::sync::RwLockWriteGuard<'_, ConversationStore> {
        self.inner.store.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use crate::speech::PlaybackOutcome;
    use crate::transport::ChunkSink;
    use crate::transport::types::{AudioClip, GenerateChunk, GenerateRequest, TtsRequest};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::{Notify, oneshot};

    #[derive(Default)]
    struct EchoBackend {
        calls: AtomicU32,
        fail: bool,
        gate: Option<Arc<Notify>>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GenerationBackend for EchoBackend {
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
            if self.fail {
                return Err(ApiError::from_status(404, "model missing"));
            }
            for part in ["Hi", " there"] {
                on_chunk(&GenerateChunk::fragment(part));
            }
            let last = GenerateChunk::last("!");
            on_chunk(&last);
            Ok(last)
        }
    }

    #[derive(Default)]
    struct FakeSpeech {
        calls: AtomicU32,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl SpeechSynthesisClient for FakeSpeech {
        async fn synthesize(&self, request: &TtsRequest) -> Result<AudioClip> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(AudioClip::new(request.text.clone().into_bytes(), None))
        }
    }

    /// Output that keeps playing until stopped.
    #[derive(Default)]
    struct HeldOutput {
        pending: Mutex<Vec<oneshot::Sender<PlaybackOutcome>>>,
    }

    impl AudioOutput for HeldOutput {
        fn start(
            &self,
            _id: &MessageId,
            _clip: &AudioClip,
            done: oneshot::Sender<PlaybackOutcome>,
        ) -> Result<()> {
            self.pending.lock().unwrap_or_else(|e| e.into_inner()).push(done);
            Ok(())
        }

        fn stop(&self) {
            for tx in self.pending.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
                let _ = tx.send(PlaybackOutcome::Stopped);
            }
        }
    }

    fn orchestrator(backend: Arc<EchoBackend>, speech: Arc<FakeSpeech>) -> ChatOrchestrator {
        let mut config = AppConfig::default();
        config.session.model_name = "test-model".into();
        ChatOrchestrator::new(&config, backend, speech, Arc::new(HeldOutput::default()))
            .unwrap_or_else(|e| panic!("build failed: {e}"))
    }

    #[tokio::test]
    async fn send_message_appends_user_and_assistant() {
        let chat = orchestrator(Arc::default(), Arc::default());
        let reply = chat.send_message("Hello").await;

        assert_eq!(reply.map(|m| m.content).as_deref(), Some("Hi there!"));
        let messages = chat.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(chat.streaming().is_none());
        assert!(!chat.is_generating());
    }

    #[tokio::test]
    async fn initialize_greets_once() {
        let backend = Arc::new(EchoBackend::default());
        let chat = orchestrator(Arc::clone(&backend), Arc::default());

        let greeting = chat.initialize().await;
        assert!(greeting.is_some());
        assert!(chat.initialize().await.is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        let messages = chat.messages();
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, JOINED_NOTICE);
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn initialize_skips_when_history_exists() {
        let backend = Arc::new(EchoBackend::default());
        let chat = orchestrator(Arc::clone(&backend), Arc::default());
        chat.send_message("Hello").await;
        assert!(chat.initialize().await.is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_stored_not_returned() {
        let backend = Arc::new(EchoBackend {
            fail: true,
            ..EchoBackend::default()
        });
        let chat = orchestrator(backend, Arc::default());

        assert!(chat.send_message("Hello").await.is_none());
        assert_eq!(chat.error().and_then(|e| e.status()), Some(404));
        assert_eq!(chat.messages().len(), 1);
        assert!(chat.speech_error().is_none());
    }

    #[tokio::test]
    async fn duplicate_send_while_generating_is_ignored() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(EchoBackend {
            gate: Some(Arc::clone(&gate)),
            ..EchoBackend::default()
        });
        let chat = orchestrator(Arc::clone(&backend), Arc::default());

        let first = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send_message("one").await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(chat.is_generating());
        assert!(chat.send_message("two").await.is_none());
        assert_eq!(chat.messages().len(), 1);

        gate.notify_one();
        let reply = first.await.unwrap_or_else(|e| panic!("join failed: {e}"));
        assert!(reply.is_some());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn blank_message_is_ignored() {
        let backend = Arc::new(EchoBackend::default());
        let chat = orchestrator(Arc::clone(&backend), Arc::default());
        assert!(chat.send_message("   ").await.is_none());
        assert!(chat.messages().is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn completed_reply_is_spoken_automatically() {
        let speech = Arc::new(FakeSpeech::default());
        let chat = orchestrator(Arc::default(), Arc::clone(&speech));

        let reply = chat
            .send_message("Hello")
            .await
            .unwrap_or_else(|| panic!("no reply"));
        chat.wait_for_background_tasks().await;

        assert_eq!(speech.calls.load(Ordering::SeqCst), 1);
        assert_eq!(chat.playback_status().currently_playing, Some(reply.id));
    }

    #[tokio::test]
    async fn second_reply_is_cached_while_first_plays() {
        let speech = Arc::new(FakeSpeech::default());
        let chat = orchestrator(Arc::default(), Arc::clone(&speech));

        let first = chat.send_message("one").await.unwrap_or_else(|| panic!("no reply"));
        chat.wait_for_background_tasks().await;
        let second = chat.send_message("two").await.unwrap_or_else(|| panic!("no reply"));
        chat.wait_for_background_tasks().await;

        let status = chat.playback_status();
        assert_eq!(status.currently_playing, Some(first.id));
        assert_eq!(status.cached_count, 2);

        assert!(chat.play_speech(&second.id).await.is_ok());
        assert_eq!(chat.playback_status().currently_playing, Some(second.id));
        assert_eq!(speech.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auto_speak_can_be_disabled() {
        let speech = Arc::new(FakeSpeech::default());
        let chat = orchestrator(Arc::default(), Arc::clone(&speech));
        chat.set_auto_speak(false);
        chat.send_message("Hello").await;
        chat.wait_for_background_tasks().await;
        assert_eq!(speech.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn clear_chat_keeps_speech_cache_and_stops_audio() {
        let chat = orchestrator(Arc::default(), Arc::default());
        chat.send_message("Hello").await;
        chat.wait_for_background_tasks().await;
        assert!(chat.playback_status().currently_playing.is_some());

        chat.clear_chat();

        assert!(chat.messages().is_empty());
        assert!(chat.error().is_none());
        let status = chat.playback_status();
        assert!(status.currently_playing.is_none());
        assert_eq!(status.cached_count, 1);
    }

    #[tokio::test]
    async fn clear_chat_cancels_active_turn() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(EchoBackend {
            gate: Some(gate),
            ..EchoBackend::default()
        });
        let chat = orchestrator(Arc::clone(&backend), Arc::default());
        let running = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send_message("Hello").await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        chat.clear_chat();
        let reply = running.await.unwrap_or_else(|e| panic!("join failed: {e}"));

        assert!(reply.is_none());
        assert!(chat.messages().is_empty());
        assert!(chat.error().is_none());
        assert!(!chat.is_generating());
    }

    #[tokio::test]
    async fn clear_chat_is_idle_immediately_and_accepts_next_send() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(EchoBackend {
            gate: Some(Arc::clone(&gate)),
            ..EchoBackend::default()
        });
        let chat = orchestrator(Arc::clone(&backend), Arc::default());
        let first = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send_message("Hello").await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // Checked before the cancelled turn gets a chance to unwind.
        chat.clear_chat();
        assert_eq!(chat.turn_state(), TurnState::Idle);
        assert!(!chat.is_generating());

        let second = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send_message("Again").await })
        };
        while backend.calls.load(Ordering::SeqCst) < 2 || !first.is_finished() {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        let first = first.await.unwrap_or_else(|e| panic!("join failed: {e}"));
        let second = second.await.unwrap_or_else(|e| panic!("join failed: {e}"));
        assert!(first.is_none());
        assert_eq!(second.map(|m| m.content).as_deref(), Some("Hi there!"));
        let messages = chat.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "Again");
        assert!(!chat.is_generating());
    }

    #[tokio::test]
    async fn abandoned_greeting_releases_the_session() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(EchoBackend {
            gate: Some(Arc::clone(&gate)),
            ..EchoBackend::default()
        });
        let chat = orchestrator(Arc::clone(&backend), Arc::default());
        let mut events = chat.subscribe();

        let greeting =
            tokio::time::timeout(std::time::Duration::from_millis(20), chat.initialize()).await;
        assert!(greeting.is_err());
        assert!(!chat.is_generating());
        assert_eq!(chat.turn_state(), TurnState::Failed);
        assert!(chat.streaming().is_none());
        assert!(chat.error().is_none());

        let mut ended = false;
        while let Ok(event) = events.try_recv() {
            if let ChatEvent::Turn(TurnEvent::Failed { error, .. }) = event {
                ended = error.is_cancelled();
            }
        }
        assert!(ended);

        let next = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send_message("Hello").await })
        };
        while backend.calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();
        let reply = next.await.unwrap_or_else(|e| panic!("join failed: {e}"));
        assert!(reply.is_some());
    }

    #[tokio::test]
    async fn clear_chat_drops_pending_auto_speech() {
        let gate = Arc::new(Notify::new());
        let speech = Arc::new(FakeSpeech {
            gate: Some(Arc::clone(&gate)),
            ..FakeSpeech::default()
        });
        let chat = orchestrator(Arc::default(), Arc::clone(&speech));
        assert!(chat.send_message("Hello").await.is_some());
        while speech.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        chat.clear_chat();
        gate.notify_one();
        chat.wait_for_background_tasks().await;

        assert!(chat.messages().is_empty());
        assert!(chat.playback_status().currently_playing.is_none());
        assert!(chat.speech_error().is_none());
    }

    #[tokio::test]
    async fn auto_speech_resumes_after_clear() {
        let speech = Arc::new(FakeSpeech::default());
        let chat = orchestrator(Arc::default(), Arc::clone(&speech));
        chat.clear_chat();

        let reply = chat
            .send_message("Hello")
            .await
            .unwrap_or_else(|| panic!("no reply"));
        chat.wait_for_background_tasks().await;
        assert_eq!(chat.playback_status().currently_playing, Some(reply.id));
    }

    #[tokio::test]
    async fn pause_without_playback_is_a_no_op() {
        let chat = orchestrator(Arc::default(), Arc::default());
        assert_eq!(chat.pause_speech().ok(), Some(false));
        assert_eq!(chat.resume_speech().ok(), Some(false));
        assert!(chat.speech_error().is_none());
    }

    #[tokio::test]
    async fn update_config_keeps_history_and_applies_next_turn() {
        let backend = Arc::new(EchoBackend::default());
        let chat = orchestrator(Arc::clone(&backend), Arc::default());
        chat.send_message("Hello").await;

        let update = SessionConfigUpdate::default()
            .system_prompt("NEW PROMPT")
            .temperature(1.2);
        assert!(chat.update_config(&update).is_ok());
        assert_eq!(chat.messages().len(), 2);

        chat.send_message("Again").await;
        let prompts = backend.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone();
        assert!(prompts[1].starts_with("NEW PROMPT"));
        assert!(prompts[1].contains("Candidate: Hello"));
    }

    #[tokio::test]
    async fn invalid_update_is_rejected_and_previous_kept() {
        let chat = orchestrator(Arc::default(), Arc::default());
        let before = chat.session_config();
        assert!(chat
            .update_config(&SessionConfigUpdate::default().temperature(3.0))
            .is_err());
        assert_eq!(chat.session_config(), before);
    }

    #[tokio::test]
    async fn play_unknown_message_is_an_error() {
        let chat = orchestrator(Arc::default(), Arc::default());
        let result = chat.play_speech(&MessageId::from_raw("nope")).await;
        assert!(matches!(result, Err(ApiError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn transcript_includes_streaming_entry() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(EchoBackend {
            gate: Some(Arc::clone(&gate)),
            ..EchoBackend::default()
        });
        let chat = orchestrator(Arc::clone(&backend), Arc::default());
        let running = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send_message("Hello").await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let transcript = chat.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].speaker, Speaker::Candidate);
        assert_eq!(transcript[1].speaker, Speaker::AiInterviewer);
        assert!(transcript[1].id.starts_with("turn_"));

        gate.notify_one();
        let _ = running.await;
        assert_eq!(chat.transcript().len(), 2);
        assert!(chat.transcript()[1].id.starts_with("msg_"));
    }

    #[tokio::test]
    async fn update_from_transcript_rebuilds_history() {
        let source = orchestrator(Arc::default(), Arc::default());
        source.send_message("Hello").await;
        let entries = source.transcript();

        let chat = orchestrator(Arc::default(), Arc::default());
        chat.update_from_transcript(&entries);
        let messages = chat.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(chat.transcript(), entries);
    }

    #[tokio::test]
    async fn subscribers_receive_turn_events() {
        let chat = orchestrator(Arc::default(), Arc::default());
        let mut events = chat.subscribe();
        chat.send_message("Hello").await;

        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ChatEvent::Turn(TurnEvent::Progress { content, .. }) = event {
                progress.push(content);
            }
        }
        assert_eq!(progress, vec!["Hi", "Hi there", "Hi there!"]);
    }

    #[tokio::test]
    async fn snapshot_serializes() {
        let chat = orchestrator(Arc::default(), Arc::default());
        chat.send_message("Hello").await;
        let json = serde_json::to_value(chat.snapshot()).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(json["messages"].as_array().map(Vec::len), Some(2));
        assert_eq!(json["is_generating"], false);
    }
}
