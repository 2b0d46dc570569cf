//! Audio output devices.
//!
//! [`AudioOutput`] is the single playback handle owned by the speech
//! pipeline. Starting a clip is synchronous; its end is reported through
//! the supplied oneshot sender.

use crate::config::PlaybackConfig;
use crate::conversation::MessageId;
use crate::error::{ApiError, Result};
use crate::transport::types::AudioClip;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a started clip ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Played to the end.
    Finished,
    /// Halted by [`AudioOutput::stop`].
    Stopped,
    /// The device or player failed.
    Failed(String),
}

/// Exclusive audio playback handle.
pub trait AudioOutput: Send + Sync {
    /// Begin playing `clip`, reporting its end on `done`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Playback`] when playback cannot start.
    fn start(
        &self,
        id: &MessageId,
        clip: &AudioClip,
        done: oneshot::Sender<PlaybackOutcome>,
    ) -> Result<()>;

    /// Halt whatever is playing. No-op when idle.
    fn stop(&self);

    /// Suspend the current clip so [`AudioOutput::resume`] continues it.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Playback`] when the output cannot pause.
    fn pause(&self) -> Result<()> {
        Err(ApiError::Playback(
            "pause is not supported by this output".to_owned(),
        ))
    }

    /// Continue a clip suspended by [`AudioOutput::pause`].
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Playback`] when the output cannot resume.
    fn resume(&self) -> Result<()> {
        Err(ApiError::Playback(
            "resume is not supported by this output".to_owned(),
        ))
    }
}

/// Output that completes every clip immediately. Used headless.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudioOutput;

impl AudioOutput for NullAudioOutput {
    fn start(
        &self,
        id: &MessageId,
        clip: &AudioClip,
        done: oneshot::Sender<PlaybackOutcome>,
    ) -> Result<()> {
        debug!(message_id = %id, bytes = clip.len(), "discarding audio");
        let _ = done.send(PlaybackOutcome::Finished);
        Ok(())
    }

    fn stop(&self) {}

    fn pause(&self) -> Result<()> {
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        Ok(())
    }
}

/// Players probed on `PATH`, with the arguments that make them play a file
/// once without a window.
const KNOWN_PLAYERS: &[(&str, &[&str])] = &[
    ("mpg123", &["-q"]),
    ("ffplay", &["-nodisp", "-autoexit", "-loglevel", "quiet"]),
    ("afplay", &[]),
    ("paplay", &[]),
];

static CLIP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
struct RunningPlayer {
    stop: CancellationToken,
    pid: Option<u32>,
}

/// Plays clips through an external player process.
///
/// Pause and resume suspend the player with `SIGSTOP`/`SIGCONT`, so they
/// are only available on Unix.
#[derive(Debug)]
pub struct ProcessAudioOutput {
    program: PathBuf,
    args: Vec<String>,
    current: Mutex<Option<RunningPlayer>>,
}

impl ProcessAudioOutput {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            current: Mutex::new(None),
        }
    }

    /// Use the configured player, or the first known player on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Playback`] when no player can be found.
    pub fn discover(config: &PlaybackConfig) -> Result<Self> {
        if let Some(player) = &config.player {
            let program = which::which(player)
                .map_err(|e| ApiError::Playback(format!("player {player} not found: {e}")))?;
            return Ok(Self::new(program, config.player_args.clone()));
        }
        for (name, args) in KNOWN_PLAYERS {
            if let Ok(program) = which::which(name) {
                info!(player = %program.display(), "using audio player");
                let args = args.iter().map(|a| (*a).to_owned()).collect();
                return Ok(Self::new(program, args));
            }
        }
        Err(ApiError::Playback(
            "no audio player found on PATH".to_owned(),
        ))
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    fn replace_current(&self, next: Option<RunningPlayer>) {
        let previous = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, next)
        };
        if let Some(previous) = previous {
            previous.stop.cancel();
        }
    }

    fn signal_current(&self, action: PlayerSignal) -> Result<()> {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pid) = current
            .as_ref()
            .filter(|p| !p.stop.is_cancelled())
            .and_then(|p| p.pid)
        else {
            return Ok(());
        };
        signal_player(pid, action)
    }
}

#[derive(Debug, Clone, Copy)]
enum PlayerSignal {
    Suspend,
    Continue,
}

#[cfg(unix)]
fn signal_player(pid: u32, action: PlayerSignal) -> Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| ApiError::Playback(format!("player pid {pid} out of range")))?;
    let signal = match action {
        PlayerSignal::Suspend => libc::SIGSTOP,
        PlayerSignal::Continue => libc::SIGCONT,
    };
    // SAFETY: kill(2) takes plain integers and touches no memory.
    let ret = unsafe { libc::kill(pid, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(ApiError::Playback(format!(
            "failed to signal audio player: {}",
            std::io::Error::last_os_error()
        )))
    }
}

#[cfg(not(unix))]
fn signal_player(_pid: u32, _action: PlayerSignal) -> Result<()> {
    Err(ApiError::Playback(
        "pausing the audio player is not supported on this platform".to_owned(),
    ))
}

impl AudioOutput for ProcessAudioOutput {
    fn start(
        &self,
        id: &MessageId,
        clip: &AudioClip,
        done: oneshot::Sender<PlaybackOutcome>,
    ) -> Result<()> {
        let n = CLIP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "vocalis-{}-{id}-{n}.{}",
            std::process::id(),
            clip.extension()
        ));
        std::fs::write(&path, &clip.data)
            .map_err(|e| ApiError::Playback(format!("failed to stage audio: {e}")))?;

        let mut child = match tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(ApiError::Playback(format!(
                    "failed to launch {}: {e}",
                    self.program.display()
                )));
            }
        };

        let token = CancellationToken::new();
        self.replace_current(Some(RunningPlayer {
            stop: token.clone(),
            pid: child.id(),
        }));

        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => {
                    // The pid is reaped; no more signals to it.
                    token.cancel();
                    match status {
                        Ok(status) if status.success() => PlaybackOutcome::Finished,
                        Ok(status) => PlaybackOutcome::Failed(format!("player exited with {status}")),
                        Err(e) => PlaybackOutcome::Failed(e.to_string()),
                    }
                }
                () = token.cancelled() => {
                    // SIGKILL also ends a suspended player.
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to stop audio player");
                    }
                    PlaybackOutcome::Stopped
                }
            };
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!(error = %e, path = %path.display(), "failed to remove staged audio");
            }
            let _ = done.send(outcome);
        });
        Ok(())
    }

    fn stop(&self) {
        self.replace_current(None);
    }

    fn pause(&self) -> Result<()> {
        self.signal_current(PlayerSignal::Suspend)
    }

    fn resume(&self) -> Result<()> {
        self.signal_current(PlayerSignal::Continue)
    }
}
