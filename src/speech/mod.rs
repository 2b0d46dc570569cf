//! Speech synthesis cache and exclusive playback.
//!
//! Audio is synthesized at most once per message id; concurrent requests
//! for the same id share one backend call and its outcome, success or
//! failure. Playback goes through a single [`AudioOutput`] so at most one
//! utterance is audible at a time.

pub mod output;

pub use output::{AudioOutput, NullAudioOutput, PlaybackOutcome, ProcessAudioOutput};

use crate::config::SpeechSettings;
use crate::conversation::MessageId;
use crate::error::{ApiError, Result};
use crate::observability::SPAN_SPEECH_SYNTHESIZE;
use crate::transport::SpeechSynthesisClient;
use crate::transport::types::{AudioClip, TtsRequest};
use futures_util::future::{self, BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Speech pipeline notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    Synthesized {
        message_id: MessageId,
        bytes: usize,
    },
    PlaybackStarted {
        message_id: MessageId,
    },
    PlaybackEnded {
        message_id: MessageId,
        /// Stopped or replaced rather than played to the end.
        interrupted: bool,
    },
    PlaybackPaused {
        message_id: MessageId,
    },
    PlaybackResumed {
        message_id: MessageId,
    },
    Failed {
        message_id: Option<MessageId>,
        error: ApiError,
    },
}

/// Receives speech events synchronously.
pub trait SpeechObserver: Send + Sync {
    fn on_event(&self, event: &SpeechEvent);
}

impl<F> SpeechObserver for F
where
    F: Fn(&SpeechEvent) + Send + Sync,
{
    fn on_event(&self, event: &SpeechEvent) {
        self(event);
    }
}

/// Read-only playback view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackStatus {
    pub currently_playing: Option<MessageId>,
    pub paused: bool,
    pub is_synthesizing: bool,
    pub cached_count: usize,
}

#[derive(Debug, Default)]
struct PlaybackSlot {
    current: Option<MessageId>,
    paused: bool,
    /// Bumped on every start and stop; completions from older epochs are stale.
    epoch: u64,
}

type PendingClip = future::Shared<BoxFuture<'static, Result<AudioClip>>>;

enum CacheEntry {
    Ready(AudioClip),
    /// A request in flight. `ticket` tells it apart from a newer request for
    /// the same id after the cache was cleared.
    Pending { ticket: u64, clip: PendingClip },
}

#[derive(Default)]
struct SpeechCache {
    entries: HashMap<MessageId, CacheEntry>,
    next_ticket: u64,
}

impl SpeechCache {
    /// Store the outcome of request `ticket`, unless it was superseded.
    /// Failures only drop the pending entry.
    fn complete(&mut self, id: &MessageId, ticket: u64, result: &Result<AudioClip>) {
        let current = matches!(
            self.entries.get(id),
            Some(CacheEntry::Pending { ticket: t, .. }) if *t == ticket
        );
        if !current {
            return;
        }
        match result {
            Ok(clip) => {
                self.entries.insert(id.clone(), CacheEntry::Ready(clip.clone()));
            }
            Err(_) => {
                self.entries.remove(id);
            }
        }
    }

    fn ready(&self, id: &MessageId) -> Option<&AudioClip> {
        match self.entries.get(id) {
            Some(CacheEntry::Ready(clip)) => Some(clip),
            _ => None,
        }
    }
}

/// State shared with playback watcher tasks.
struct Shared {
    output: Arc<dyn AudioOutput>,
    slot: Mutex<PlaybackSlot>,
    last_error: Mutex<Option<ApiError>>,
    observer: Arc<dyn SpeechObserver>,
}

impl Shared {
    fn lock_slot(&self) -> std::sync::MutexGuard<'_, PlaybackSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_error(&self, message_id: Option<MessageId>, error: ApiError) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error.clone());
        self.observer
            .on_event(&SpeechEvent::Failed { message_id, error });
    }

    fn settle(&self, id: MessageId, epoch: u64, outcome: PlaybackOutcome) {
        {
            let mut slot = self.lock_slot();
            if slot.epoch != epoch {
                debug!(message_id = %id, "ignoring stale playback completion");
                return;
            }
            slot.current = None;
            slot.paused = false;
        }
        match outcome {
            PlaybackOutcome::Finished => {
                debug!(message_id = %id, "playback finished");
                self.observer.on_event(&SpeechEvent::PlaybackEnded {
                    message_id: id,
                    interrupted: false,
                });
            }
            PlaybackOutcome::Stopped => {
                self.observer.on_event(&SpeechEvent::PlaybackEnded {
                    message_id: id,
                    interrupted: true,
                });
            }
            PlaybackOutcome::Failed(reason) => {
                warn!(message_id = %id, %reason, "playback failed");
                self.record_error(Some(id), ApiError::Playback(reason));
            }
        }
    }
}

/// Per-message speech cache plus the playback handle.
pub struct SpeechPipeline {
    client: Arc<dyn SpeechSynthesisClient>,
    settings: RwLock<SpeechSettings>,
    cache: Arc<Mutex<SpeechCache>>,
    in_flight: Arc<AtomicUsize>,
    shared: Arc<Shared>,
}

impl SpeechPipeline {
    pub fn new(
        client: Arc<dyn SpeechSynthesisClient>,
        output: Arc<dyn AudioOutput>,
        settings: SpeechSettings,
        observer: Arc<dyn SpeechObserver>,
    ) -> Self {
        Self {
            client,
            settings: RwLock::new(settings),
            cache: Arc::new(Mutex::new(SpeechCache::default())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            shared: Arc::new(Shared {
                output,
                slot: Mutex::new(PlaybackSlot::default()),
                last_error: Mutex::new(None),
                observer,
            }),
        }
    }

    pub fn settings(&self) -> SpeechSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// # Errors
    ///
    /// Returns [`ApiError::Config`] for unsupported voice parameters.
    pub fn update_settings(&self, settings: SpeechSettings) -> Result<()> {
        settings.validate()?;
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        Ok(())
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, SpeechCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Audio for `id`, synthesizing `text` on first request.
    ///
    /// Callers that arrive while a request for `id` is in flight wait for it
    /// and get its result, including its error.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] for blank text or the backend
    /// failure. Failures are not cached.
    pub async fn synthesize(&self, id: &MessageId, text: &str) -> Result<AudioClip> {
        if text.trim().is_empty() {
            return Err(ApiError::InvalidRequest(
                "speech text must not be empty".to_owned(),
            ));
        }
        let pending = {
            let mut cache = self.lock_cache();
            match cache.entries.get(id) {
                Some(CacheEntry::Ready(clip)) => {
                    debug!(message_id = %id, "speech cache hit");
                    return Ok(clip.clone());
                }
                Some(CacheEntry::Pending { clip, .. }) => {
                    debug!(message_id = %id, "joining in-flight synthesis");
                    clip.clone()
                }
                None => {
                    cache.next_ticket += 1;
                    let ticket = cache.next_ticket;
                    let clip = self.request(id, text, ticket);
                    cache.entries.insert(
                        id.clone(),
                        CacheEntry::Pending {
                            ticket,
                            clip: clip.clone(),
                        },
                    );
                    clip
                }
            }
        };
        pending.await
    }

    /// One backend request, shared by every caller that joins it. The
    /// outcome is cached and reported exactly once.
    fn request(&self, id: &MessageId, text: &str, ticket: u64) -> PendingClip {
        let settings = self.settings();
        let request = TtsRequest {
            text: text.to_owned(),
            lang: settings.lang,
            tld: settings.tld,
            slow: settings.slow,
        };
        let client = Arc::clone(&self.client);
        let counter = Arc::clone(&self.in_flight);
        let cache: Weak<Mutex<SpeechCache>> = Arc::downgrade(&self.cache);
        let shared = Arc::clone(&self.shared);
        let id = id.clone();
        let span = info_span!(SPAN_SPEECH_SYNTHESIZE, message_id = %id);

        async move {
            let result = {
                let _in_flight = InFlight::enter(counter);
                client.synthesize(&request).await
            };
            if let Some(cache) = cache.upgrade() {
                cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .complete(&id, ticket, &result);
            }
            match &result {
                Ok(clip) => {
                    info!(message_id = %id, bytes = clip.len(), "speech ready");
                    shared.observer.on_event(&SpeechEvent::Synthesized {
                        message_id: id.clone(),
                        bytes: clip.len(),
                    });
                }
                Err(err) => {
                    warn!(message_id = %id, error = %err, "speech synthesis failed");
                    shared.record_error(Some(id.clone()), err.clone());
                }
            }
            result
        }
        .instrument(span)
        .boxed()
        .shared()
    }

    /// Synthesize if needed, then play, stopping any current utterance first.
    ///
    /// # Errors
    ///
    /// Returns the synthesis failure or [`ApiError::Playback`] when the
    /// output cannot start. Both are also recorded in [`Self::last_error`].
    pub async fn play(&self, id: &MessageId, text: &str) -> Result<()> {
        let clip = self.synthesize(id, text).await?;
        self.start_playback(id, &clip, None).map(|_| ())
    }

    /// Synthesize, then play only when nothing else is playing and
    /// `session` has not been cancelled.
    ///
    /// Returns whether playback started; otherwise the audio stays cached.
    ///
    /// # Errors
    ///
    /// As [`Self::play`].
    pub async fn play_if_idle(
        &self,
        id: &MessageId,
        text: &str,
        session: &CancellationToken,
    ) -> Result<bool> {
        if session.is_cancelled() {
            debug!(message_id = %id, "speech session ended, not playing");
            return Ok(false);
        }
        let clip = self.synthesize(id, text).await?;
        self.start_playback(id, &clip, Some(session))
    }

    /// Start `clip`. With a `session`, playback is automatic: it only starts
    /// while idle and while the session is live.
    fn start_playback(
        &self,
        id: &MessageId,
        clip: &AudioClip,
        session: Option<&CancellationToken>,
    ) -> Result<bool> {
        let (done_tx, done_rx) = oneshot::channel();
        let (epoch, replaced) = {
            let mut slot = self.shared.lock_slot();
            if let Some(session) = session {
                if session.is_cancelled() {
                    debug!(message_id = %id, "speech session ended, keeping audio cached");
                    return Ok(false);
                }
                if slot.current.is_some() {
                    debug!(message_id = %id, "playback busy, keeping audio cached");
                    return Ok(false);
                }
            }
            let replaced = slot.current.take();
            if replaced.is_some() {
                self.shared.output.stop();
            }
            slot.epoch += 1;
            slot.paused = false;
            if let Err(err) = self.shared.output.start(id, clip, done_tx) {
                drop(slot);
                self.emit_replaced(replaced);
                self.shared.record_error(Some(id.clone()), err.clone());
                return Err(err);
            }
            slot.current = Some(id.clone());
            (slot.epoch, replaced)
        };

        self.emit_replaced(replaced);
        info!(message_id = %id, "playback started");
        self.shared.observer.on_event(&SpeechEvent::PlaybackStarted {
            message_id: id.clone(),
        });

        let shared = Arc::clone(&self.shared);
        let id = id.clone();
        tokio::spawn(async move {
            let outcome = done_rx
                .await
                .unwrap_or(PlaybackOutcome::Stopped);
            shared.settle(id, epoch, outcome);
        });
        Ok(true)
    }

    fn emit_replaced(&self, replaced: Option<MessageId>) {
        if let Some(message_id) = replaced {
            self.shared.observer.on_event(&SpeechEvent::PlaybackEnded {
                message_id,
                interrupted: true,
            });
        }
    }

    /// Halt playback immediately.
    pub fn stop(&self) {
        let stopped = {
            let mut slot = self.shared.lock_slot();
            self.shared.output.stop();
            slot.epoch += 1;
            slot.paused = false;
            slot.current.take()
        };
        if let Some(id) = &stopped {
            info!(message_id = %id, "playback stopped");
        }
        self.emit_replaced(stopped);
    }

    /// Suspend the current utterance. Returns `false` when nothing is
    /// playing or it is already paused.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Playback`] when the output cannot pause; the
    /// failure is also recorded in [`Self::last_error`].
    pub fn pause(&self) -> Result<bool> {
        self.set_paused(true)
    }

    /// Continue a paused utterance. Returns `false` when nothing is paused.
    ///
    /// # Errors
    ///
    /// As [`Self::pause`].
    pub fn resume(&self) -> Result<bool> {
        self.set_paused(false)
    }

    fn set_paused(&self, paused: bool) -> Result<bool> {
        let id = {
            let mut slot = self.shared.lock_slot();
            let Some(id) = slot.current.clone() else {
                return Ok(false);
            };
            if slot.paused == paused {
                return Ok(false);
            }
            let result = if paused {
                self.shared.output.pause()
            } else {
                self.shared.output.resume()
            };
            if let Err(err) = result {
                drop(slot);
                warn!(message_id = %id, error = %err, paused, "failed to change playback state");
                self.shared.record_error(Some(id), err.clone());
                return Err(err);
            }
            slot.paused = paused;
            id
        };
        let event = if paused {
            info!(message_id = %id, "playback paused");
            SpeechEvent::PlaybackPaused { message_id: id }
        } else {
            info!(message_id = %id, "playback resumed");
            SpeechEvent::PlaybackResumed { message_id: id }
        };
        self.shared.observer.on_event(&event);
        Ok(true)
    }

    pub fn currently_playing(&self) -> Option<MessageId> {
        self.shared.lock_slot().current.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock_slot().paused
    }

    pub fn is_synthesizing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn is_cached(&self, id: &MessageId) -> bool {
        self.lock_cache().ready(id).is_some()
    }

    /// Cached audio for `id`, without synthesizing.
    pub fn cached(&self, id: &MessageId) -> Option<AudioClip> {
        self.lock_cache().ready(id).cloned()
    }

    pub fn cached_count(&self) -> usize {
        self.lock_cache()
            .entries
            .values()
            .filter(|entry| matches!(entry, CacheEntry::Ready(_)))
            .count()
    }

    /// Drop every cached clip. In-flight requests still complete for their
    /// callers but are not cached.
    pub fn clear_cache(&self) {
        self.lock_cache().entries.clear();
    }

    pub fn status(&self) -> PlaybackStatus {
        let (currently_playing, paused) = {
            let slot = self.shared.lock_slot();
            (slot.current.clone(), slot.paused)
        };
        PlaybackStatus {
            currently_playing,
            paused,
            is_synthesizing: self.is_synthesizing(),
            cached_count: self.cached_count(),
        }
    }

    /// Most recent synthesis or playback failure.
    pub fn last_error(&self) -> Option<ApiError> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear_error(&self) {
        *self.shared.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Counts a synthesis request for its lifetime.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
