//! Session negotiation with the transcoder
//!
//! A [`SessionManager`] owns exactly one transcoder session per playback
//! attempt: it creates the session, probes metadata and embedded tracks,
//! and keeps polling for a duration while a torrent source is still
//! fetching metadata. Playback never waits for the duration to appear.

use crate::error::{Error, Result};
use crate::transcoder::{SessionInfo, TranscoderClient};
use crate::types::{
    AudioTrack, CaptionFormat, EngineConfig, Session, SourceKind, SubtitleOrigin, SubtitleTrack,
    Track,
};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Manages the lifecycle of a single transcoder session
pub struct SessionManager {
    transcoder: Arc<TranscoderClient>,
    config: EngineConfig,
    session: Arc<RwLock<Option<Session>>>,
    duration_tx: watch::Sender<f64>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(transcoder: Arc<TranscoderClient>, config: EngineConfig) -> Self {
        let (duration_tx, _) = watch::channel(0.0);
        Self {
            transcoder,
            config,
            session: Arc::new(RwLock::new(None)),
            duration_tx,
            poll_task: Mutex::new(None),
        }
    }

    /// Create a session for the given source and probe its metadata.
    ///
    /// `kind` is derived from the source string shape. A create failure
    /// is fatal to the attempt and is not retried here.
    #[instrument(skip(self, source), fields(kind))]
    pub async fn create(
        &self,
        source: &str,
        start_time: f64,
        file_idx: Option<u32>,
    ) -> Result<Session> {
        let kind = SourceKind::from_source(source);
        tracing::Span::current().record("kind", kind.to_string());

        let id = self
            .transcoder
            .create_session(source, kind, start_time, file_idx)
            .await?;

        let info = self.transcoder.session_info(&id).await?;
        let session = build_session(&self.transcoder, id, &info);

        info!(
            session_id = %session.id,
            duration = session.duration_seconds,
            tracks = session.embedded_tracks.len(),
            "Session created"
        );

        // send_replace so late subscribers still observe the duration
        self.duration_tx.send_replace(session.duration_seconds);
        *self.session.write().await = Some(session.clone());

        if session.duration_seconds <= 0.0 {
            self.spawn_duration_poll(session.id.clone()).await;
        }

        Ok(session)
    }

    /// Re-fetch session metadata on demand
    pub async fn fetch_session_info(&self, session_id: &str) -> Result<SessionInfo> {
        self.transcoder.session_info(session_id).await
    }

    /// Current session, if one is active
    pub async fn session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    /// Observe duration updates (fires when a polled duration lands)
    pub fn subscribe_duration(&self) -> watch::Receiver<f64> {
        self.duration_tx.subscribe()
    }

    /// Poll for a positive duration on a bounded schedule. Common while
    /// a torrent session is still fetching metadata.
    async fn spawn_duration_poll(&self, session_id: String) {
        let transcoder = self.transcoder.clone();
        let session = self.session.clone();
        let duration_tx = self.duration_tx.clone();
        let attempts = self.config.duration_poll_attempts;
        let interval = self.config.duration_poll_interval;

        let handle = tokio::spawn(async move {
            for attempt in 0..attempts {
                tokio::time::sleep(interval).await;
                let info = match transcoder.session_info(&session_id).await {
                    Ok(info) => info,
                    Err(err) => {
                        debug!(attempt, error = %err, "Duration poll failed");
                        continue;
                    }
                };
                if info.duration_seconds.is_finite() && info.duration_seconds > 0.0 {
                    debug!(
                        attempt,
                        duration = info.duration_seconds,
                        "Duration resolved"
                    );
                    if let Some(current) = session.write().await.as_mut() {
                        current.duration_seconds = info.duration_seconds;
                    }
                    duration_tx.send_replace(info.duration_seconds);
                    return;
                }
            }
            warn!(session_id, "Duration still unknown after polling window");
        });

        let mut task = self.poll_task.lock().await;
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(handle);
    }

    /// Tear down the session: stop polling and notify the transcoder.
    ///
    /// The cleanup call is fire-and-forget; losing it on process kill
    /// is acceptable.
    pub async fn destroy(&self) {
        if let Some(task) = self.poll_task.lock().await.take() {
            task.abort();
        }
        if let Some(session) = self.session.write().await.take() {
            self.transcoder.cleanup(&session.id);
            debug!(session_id = %session.id, "Session destroyed");
        }
    }
}

/// Shape probe output into the session track model. Audio streams become
/// embedded tracks with the server's active index marked selected; the
/// subtitle list starts with the "Off" sentinel followed by any streams
/// the transcoder can extract.
fn build_session(transcoder: &TranscoderClient, id: String, info: &SessionInfo) -> Session {
    let mut tracks: Vec<Track> = info
        .available_streams
        .iter()
        .filter(|s| s.kind == "audio")
        .map(|s| {
            Track::Audio(AudioTrack {
                index: s.index,
                label: s
                    .title
                    .clone()
                    .or_else(|| s.language.clone())
                    .unwrap_or_else(|| format!("Audio {}", s.index)),
                language: s.language.clone(),
                selected: s.index == info.audio_index,
            })
        })
        .collect();
    tracks.push(Track::Subtitle(SubtitleTrack::off()));
    for s in info.available_streams.iter().filter(|s| s.kind == "subtitle") {
        tracks.push(Track::Subtitle(SubtitleTrack {
            id: format!("embedded-{}", s.index),
            label: s
                .title
                .clone()
                .or_else(|| s.language.clone())
                .unwrap_or_else(|| format!("Subtitle {}", s.index)),
            language: s.language.clone(),
            url: transcoder.subtitle_url(&id, s.index).ok(),
            origin: SubtitleOrigin::Embedded,
            format: Some(CaptionFormat::Vtt),
            selected: false,
        }));
    }

    Session {
        id,
        duration_seconds: info.duration_seconds,
        embedded_tracks: tracks,
        audio_index: info.audio_index,
        chapters: info.chapters.clone(),
        torrent_info_hash: info.torrent_info_hash.clone(),
    }
}
