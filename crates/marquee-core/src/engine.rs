//! Playback orchestration
//!
//! [`PlayerEngine`] composes the session, manifest, subtitle, and watch
//! party pieces for a single playback attempt and owns the teardown
//! contract. Shells talk to the engine; the engine wires the internal
//! channels (duration into the controller, offset into the subtitle
//! engine, reslice epochs back into subtitle re-fetches).

use crate::error::{Error, Result};
use crate::manifest::{ManifestController, MediaSurface};
use crate::party::{PartyStore, WatchPartyCoordinator};
use crate::session::SessionManager;
use crate::subtitles::{DelayStore, SubtitleEngine};
use crate::transcoder::{ClipRequest, ClipResponse, TranscoderClient};
use crate::types::{Chapter, EngineConfig, SeekOutcome, Session, SubtitleTrack, Track};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use url::Url;

/// One engine instance drives one playback attempt at a time
pub struct PlayerEngine {
    config: EngineConfig,
    transcoder: Arc<TranscoderClient>,
    sessions: Arc<SessionManager>,
    surface: Arc<dyn MediaSurface>,
    delay_store: Arc<dyn DelayStore>,
    manifest: RwLock<Option<Arc<ManifestController>>>,
    subtitles: RwLock<Option<Arc<SubtitleEngine>>>,
    reslice_task: Mutex<Option<JoinHandle<()>>>,
}

impl PlayerEngine {
    pub fn new(
        transcoder_base: Url,
        surface: Arc<dyn MediaSurface>,
        delay_store: Arc<dyn DelayStore>,
        config: EngineConfig,
    ) -> Self {
        let transcoder = Arc::new(TranscoderClient::new(
            transcoder_base,
            config.request_timeout,
        ));
        let sessions = Arc::new(SessionManager::new(transcoder.clone(), config.clone()));
        Self {
            config,
            transcoder,
            sessions,
            surface,
            delay_store,
            manifest: RwLock::new(None),
            subtitles: RwLock::new(None),
            reslice_task: Mutex::new(None),
        }
    }

    /// Start playback of a source: negotiate the session, load the
    /// manifest, stand up the caption pipeline, and auto-select a
    /// subtitle track for the active audio language.
    #[instrument(skip(self, source))]
    pub async fn load(
        &self,
        source: &str,
        start_time: f64,
        file_idx: Option<u32>,
    ) -> Result<Session> {
        self.teardown().await;

        let session = self.sessions.create(source, start_time, file_idx).await?;

        let controller = Arc::new(ManifestController::new(
            session.id.clone(),
            self.transcoder.clone(),
            self.surface.clone(),
            self.sessions.subscribe_duration(),
            self.config.clone(),
        ));
        controller.load(start_time).await?;

        let subtitles = Arc::new(SubtitleEngine::new(
            controller.subscribe_offset(),
            self.delay_store.clone(),
            self.config.clone(),
        ));

        let subtitle_tracks: Vec<SubtitleTrack> = session
            .embedded_tracks
            .iter()
            .filter_map(|t| match t {
                Track::Subtitle(s) if !s.is_off() => Some(s.clone()),
                _ => None,
            })
            .collect();
        subtitles.set_tracks(subtitle_tracks).await;

        let audio_language = session.embedded_tracks.iter().find_map(|t| match t {
            Track::Audio(a) if a.selected => a.language.clone(),
            _ => None,
        });
        if let Err(err) = subtitles.auto_select(audio_language.as_deref()).await {
            warn!(error = %err, "Subtitle auto-selection failed");
        }

        self.spawn_reslice_listener(controller.clone(), subtitles.clone())
            .await;

        *self.manifest.write().await = Some(controller);
        *self.subtitles.write().await = Some(subtitles);

        info!(session_id = %session.id, "Playback loaded");
        Ok(session)
    }

    /// A completed hard seek changes the offset, so the selected track's
    /// payload is stale and is fetched again
    async fn spawn_reslice_listener(
        &self,
        controller: Arc<ManifestController>,
        subtitles: Arc<SubtitleEngine>,
    ) {
        let mut reslices = controller.subscribe_reslices();
        let handle = tokio::spawn(async move {
            while reslices.changed().await.is_ok() {
                if let Err(err) = subtitles.refetch_selected().await {
                    warn!(error = %err, "Subtitle re-fetch after reslice failed");
                }
            }
        });

        let mut task = self.reslice_task.lock().await;
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    async fn controller(&self) -> Result<Arc<ManifestController>> {
        self.manifest
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Internal("no active playback".to_string()))
    }

    async fn subtitle_engine(&self) -> Result<Arc<SubtitleEngine>> {
        self.subtitles
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Internal("no active playback".to_string()))
    }

    /// The active manifest controller, for state/offset subscriptions
    pub async fn manifest(&self) -> Option<Arc<ManifestController>> {
        self.manifest.read().await.clone()
    }

    /// The active subtitle engine, for cue subscriptions
    pub async fn subtitles(&self) -> Option<Arc<SubtitleEngine>> {
        self.subtitles.read().await.clone()
    }

    pub async fn session(&self) -> Option<Session> {
        self.sessions.session().await
    }

    pub async fn chapters(&self) -> Vec<Chapter> {
        self.sessions
            .session()
            .await
            .map(|s| s.chapters)
            .unwrap_or_default()
    }

    pub async fn seek(&self, target_global: f64) -> Result<SeekOutcome> {
        self.controller().await?.seek(target_global).await
    }

    pub async fn global_time(&self) -> f64 {
        match self.manifest.read().await.as_ref() {
            Some(controller) => controller.global_time(),
            None => 0.0,
        }
    }

    pub async fn switch_audio_track(&self, index: u32) -> Result<()> {
        self.controller().await?.switch_audio_track(index).await
    }

    pub async fn select_subtitle_track(&self, track_id: &str) -> Result<()> {
        self.subtitle_engine().await?.select_track(track_id).await
    }

    pub async fn set_subtitle_delay(&self, seconds: f64) -> Result<()> {
        self.subtitle_engine().await?.apply_delay(seconds).await;
        Ok(())
    }

    /// Extract a clip of the current session server-side
    pub async fn clip(&self, request: &ClipRequest) -> Result<ClipResponse> {
        let session = self
            .sessions
            .session()
            .await
            .ok_or_else(|| Error::Internal("no active playback".to_string()))?;
        self.transcoder.clip(&session.id, request).await
    }

    /// Join playback to a watch party backend, with the manifest
    /// controller as the clock being corrected
    pub async fn watch_party(
        &self,
        store: Arc<dyn PartyStore>,
        user_id: String,
    ) -> Result<WatchPartyCoordinator> {
        let controller = self.controller().await?;
        Ok(WatchPartyCoordinator::new(
            store,
            controller,
            user_id,
            self.config.clone(),
        ))
    }

    /// Tear down the current playback attempt: abort the subtitle fetch
    /// and timers, detach the surface, and fire the cleanup beacon.
    #[instrument(skip(self))]
    pub async fn teardown(&self) {
        if let Some(task) = self.reslice_task.lock().await.take() {
            task.abort();
        }
        if let Some(subtitles) = self.subtitles.write().await.take() {
            subtitles.abort_fetch().await;
        }
        if let Some(controller) = self.manifest.write().await.take() {
            controller.teardown().await;
        }
        self.sessions.destroy().await;
    }
}
