use async_trait::async_trait;
use pairlink_core::{PlaybackCommand, SessionStatus};
use thiserror::Error;
use tracing::{debug, info};

// MARK: - DisplaySurface trait

/// What the session drives on screen.
///
/// Implementations:
/// - [`LogSurface`] — writes everything to the log (headless runs, tests)
/// - a host UI wires its status text, video view and playback widget here
#[async_trait]
pub trait DisplaySurface: Send {
    /// Replace the status line.
    async fn set_status(&mut self, status: &SessionStatus);

    /// Make the remote video visible.
    async fn show_stream(&mut self);

    /// Hide the remote video and show the status screen instead.
    async fn hide_stream(&mut self);

    /// Load a video into the playback widget, starting at `start_at` seconds.
    async fn load_source(&mut self, video_id: &str, start_at: f64) -> Result<(), DisplayError>;

    /// Control the playback widget.
    async fn playback(&mut self, command: PlaybackCommand, value: Option<f64>) -> Result<(), DisplayError>;
}

// MARK: - DisplayError

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("No video loaded in the playback widget")]
    NoSource,

    #[error("Playback command {0:?} needs a value")]
    MissingValue(PlaybackCommand),

    #[error("Display unavailable: {0}")]
    Unavailable(String),
}

// MARK: - LogSurface

/// Superfície que apenas registra em log. Guarda estado suficiente para
/// rejeitar os comandos que um player real rejeitaria.
#[derive(Debug, Default)]
pub struct LogSurface {
    status: Option<SessionStatus>,
    stream_visible: bool,
    source: Option<String>,
    position: f64,
    playing: bool,
}

impl LogSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<&SessionStatus> {
        self.status.as_ref()
    }

    pub fn stream_visible(&self) -> bool {
        self.stream_visible
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn position(&self) -> f64 {
        self.position
    }
}

#[async_trait]
impl DisplaySurface for LogSurface {
    async fn set_status(&mut self, status: &SessionStatus) {
        if self.status.as_ref() != Some(status) {
            info!("[Display] {}", status);
            self.status = Some(status.clone());
        }
    }

    async fn show_stream(&mut self) {
        if !self.stream_visible {
            info!("[Display] Video visible");
        }
        self.stream_visible = true;
    }

    async fn hide_stream(&mut self) {
        if self.stream_visible {
            info!("[Display] Video hidden");
        }
        self.stream_visible = false;
    }

    async fn load_source(&mut self, video_id: &str, start_at: f64) -> Result<(), DisplayError> {
        info!("[Display] Loading video {} at {:.1}s", video_id, start_at);
        self.source = Some(video_id.to_owned());
        self.position = start_at.max(0.0);
        self.playing = true;
        Ok(())
    }

    async fn playback(&mut self, command: PlaybackCommand, value: Option<f64>) -> Result<(), DisplayError> {
        if self.source.is_none() {
            return Err(DisplayError::NoSource);
        }
        match command {
            PlaybackCommand::Play => self.playing = true,
            PlaybackCommand::Pause => self.playing = false,
            PlaybackCommand::SeekTo => {
                let to = value.ok_or(DisplayError::MissingValue(command))?;
                self.position = to.max(0.0);
            }
            PlaybackCommand::Stop => {
                self.playing = false;
                self.source = None;
                self.position = 0.0;
            }
        }
        debug!("[Display] Playback {:?} (value={:?})", command, value);
        Ok(())
    }
}
