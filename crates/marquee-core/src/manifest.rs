//! Manifest lifecycle and the seek state machine
//!
//! The [`ManifestController`] owns the adaptive-streaming manifest for a
//! session and decides, per seek request, between a **soft seek** (the
//! target is already buffered, set the media time directly) and a
//! **hard seek** (ask the transcoder for a freshly sliced manifest).
//!
//! Offset invariant: `global_time = local_media_time + offset`. The
//! offset is non-negative and is updated exactly once per completed
//! hard seek, from the authoritative slice start the server returns,
//! never from the requested target.

use crate::error::{Error, Result};
use crate::party::PlaybackControl;
use crate::transcoder::{ManifestSlice, TranscoderClient};
use crate::types::{EngineConfig, ManifestState, SeekId, SeekOutcome};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, instrument, warn};
use url::Url;

/// The decoding/rendering surface the controller drives.
///
/// The engine never decodes media itself; a shell provides a surface
/// (an hls.js-style player, a native pipeline, or a test fake) and the
/// controller feeds it manifest slices and time corrections.
#[async_trait]
pub trait MediaSurface: Send + Sync {
    /// Currently buffered local-time ranges
    fn buffered_ranges(&self) -> Vec<(f64, f64)>;

    /// Current local media time
    fn current_time(&self) -> f64;

    /// Jump to a local media time within buffered content
    fn set_current_time(&self, local: f64);

    async fn play(&self) -> Result<()>;

    fn pause(&self);

    fn is_paused(&self) -> bool;

    /// Ingest a manifest slice. Resolving means the manifest is parsed
    /// and the surface can begin decoding.
    async fn attach(&self, slice: &ManifestSlice) -> Result<()>;

    /// Recover from a media error by resetting the decoder
    async fn reset_decoder(&self) -> Result<()>;

    /// Tear down the current manifest attachment
    fn detach(&self);
}

/// True iff some buffered range contains `target` within `tolerance`
pub fn is_time_buffered(ranges: &[(f64, f64)], target: f64, tolerance: f64) -> bool {
    ranges
        .iter()
        .any(|&(start, end)| target >= start - tolerance && target <= end + tolerance)
}

/// Owns the manifest lifecycle and seek state machine for one session
pub struct ManifestController {
    session_id: String,
    transcoder: Arc<TranscoderClient>,
    surface: Arc<dyn MediaSurface>,
    config: EngineConfig,
    state: Arc<RwLock<ManifestState>>,
    state_tx: watch::Sender<ManifestState>,
    offset_tx: watch::Sender<f64>,
    duration_rx: watch::Receiver<f64>,
    /// Most recent pending hard-seek attempt; stale completions bail out
    current_seek: Arc<RwLock<Option<SeekId>>>,
    /// Bumped after every completed hard seek or track switch, so the
    /// subtitle engine can re-fetch against the new offset
    reslice_epoch: Arc<AtomicU64>,
    reslice_tx: watch::Sender<u64>,
    network_retries: AtomicU32,
    media_retries: AtomicU32,
}

impl ManifestController {
    pub fn new(
        session_id: String,
        transcoder: Arc<TranscoderClient>,
        surface: Arc<dyn MediaSurface>,
        duration_rx: watch::Receiver<f64>,
        config: EngineConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ManifestState::Idle);
        let (offset_tx, _) = watch::channel(0.0);
        let (reslice_tx, _) = watch::channel(0);
        Self {
            session_id,
            transcoder,
            surface,
            config,
            state: Arc::new(RwLock::new(ManifestState::Idle)),
            state_tx,
            offset_tx,
            duration_rx,
            current_seek: Arc::new(RwLock::new(None)),
            reslice_epoch: Arc::new(AtomicU64::new(0)),
            reslice_tx,
            network_retries: AtomicU32::new(0),
            media_retries: AtomicU32::new(0),
        }
    }

    pub async fn state(&self) -> ManifestState {
        *self.state.read().await
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ManifestState> {
        self.state_tx.subscribe()
    }

    /// Current playback offset (global = local + offset)
    pub fn current_offset(&self) -> f64 {
        *self.offset_tx.borrow()
    }

    pub fn subscribe_offset(&self) -> watch::Receiver<f64> {
        self.offset_tx.subscribe()
    }

    /// Observe slice changes (completed hard seeks and track switches)
    pub fn subscribe_reslices(&self) -> watch::Receiver<u64> {
        self.reslice_tx.subscribe()
    }

    /// Current global playback time
    pub fn global_time(&self) -> f64 {
        self.surface.current_time() + self.current_offset()
    }

    async fn set_state(&self, new_state: ManifestState) -> Result<()> {
        let current = *self.state.read().await;

        if !current.can_transition_to(new_state) {
            return Err(Error::InvalidStateTransition {
                from: current.to_string(),
                to: new_state.to_string(),
            });
        }

        *self.state.write().await = new_state;
        self.state_tx.send_replace(new_state);
        info!(from = %current, to = %new_state, "Manifest state transition");
        Ok(())
    }

    /// Mark the controller failed and surface the error
    async fn fail(&self, err: Error) -> Error {
        let _ = self.set_state(ManifestState::Error).await;
        err
    }

    // send_replace stores the value even with no live receivers; the
    // offset and state channels double as the source of truth
    fn set_offset(&self, offset: f64) {
        self.offset_tx.send_replace(offset.max(0.0));
    }

    fn bump_reslice(&self) {
        let epoch = self.reslice_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.reslice_tx.send_replace(epoch);
    }

    /// Load the initial manifest. A session that does not reach Ready
    /// within the startup window is a fatal timeout.
    #[instrument(skip(self))]
    pub async fn load(&self, start_offset: f64) -> Result<()> {
        self.set_state(ManifestState::Loading).await?;
        self.set_offset(start_offset);

        let url = self.transcoder.manifest_url(&self.session_id)?;
        let startup = self.config.startup_timeout;

        let result = tokio::time::timeout(startup, async {
            let slice = self.fetch_with_retries(&url).await?;
            self.attach_with_recovery(&slice).await?;
            Ok::<ManifestSlice, Error>(slice)
        })
        .await;

        let slice = match result {
            Ok(Ok(slice)) => slice,
            Ok(Err(err)) => return Err(self.fail(err).await),
            Err(_) => {
                let err = Error::StartupTimeout {
                    seconds: startup.as_secs(),
                };
                return Err(self.fail(err).await);
            }
        };

        if let Some(slice_start) = slice.slice_start {
            debug!(slice_start, "Received slice start offset");
            self.set_offset(slice_start);
        }
        self.set_state(ManifestState::Ready).await?;
        Ok(())
    }

    /// Seek to a global time, preferring buffered media.
    ///
    /// Soft seeks never issue a server request. Hard seeks request a
    /// fresh slice tagged with a unique seek id; only the most recent
    /// pending seek wins.
    #[instrument(skip(self))]
    pub async fn seek(&self, target_global: f64) -> Result<SeekOutcome> {
        let duration = *self.duration_rx.borrow();
        let target = if duration > 0.0 {
            target_global.clamp(0.0, duration)
        } else {
            target_global.max(0.0)
        };

        let local = target - self.current_offset();
        let buffered = is_time_buffered(
            &self.surface.buffered_ranges(),
            local,
            self.config.buffered_tolerance,
        );

        if buffered && self.state().await == ManifestState::Ready {
            self.set_state(ManifestState::SeekingSoft).await?;
            self.surface.set_current_time(local.max(0.0));
            self.set_state(ManifestState::Ready).await?;
            debug!(target, local, "Soft seek");
            return Ok(SeekOutcome::Soft);
        }

        self.hard_seek(target).await
    }

    async fn hard_seek(&self, target: f64) -> Result<SeekOutcome> {
        let seek_id = SeekId::new();
        *self.current_seek.write().await = Some(seek_id);

        let was_playing = !self.surface.is_paused();
        self.set_state(ManifestState::SeekingHard).await?;

        let url = self
            .transcoder
            .seek_manifest_url(&self.session_id, target, seek_id)?;
        debug!(target, %seek_id, "Hard seek");

        let slice = match self.fetch_with_retries(&url).await {
            Ok(slice) => slice,
            Err(err) => {
                if self.is_superseded(seek_id).await {
                    return Ok(SeekOutcome::Superseded);
                }
                return Err(self.fail(err).await);
            }
        };

        // A newer seek may have started while the slice was in flight;
        // its completion owns the offset, not ours.
        if self.is_superseded(seek_id).await {
            debug!(%seek_id, "Hard seek superseded during fetch");
            return Ok(SeekOutcome::Superseded);
        }

        if let Err(err) = self.attach_with_recovery(&slice).await {
            if self.is_superseded(seek_id).await {
                return Ok(SeekOutcome::Superseded);
            }
            return Err(self.fail(err).await);
        }

        if self.is_superseded(seek_id).await {
            debug!(%seek_id, "Hard seek superseded during attach");
            return Ok(SeekOutcome::Superseded);
        }

        let offset = slice.slice_start.unwrap_or(target).max(0.0);
        self.set_offset(offset);
        *self.current_seek.write().await = None;
        self.set_state(ManifestState::Ready).await?;
        self.bump_reslice();

        if was_playing {
            if let Err(err) = self.surface.play().await {
                warn!(error = %err, "Play after seek failed");
            }
        }

        Ok(SeekOutcome::Hard { offset })
    }

    async fn is_superseded(&self, seek_id: SeekId) -> bool {
        *self.current_seek.read().await != Some(seek_id)
    }

    /// Switch the embedded audio track: notify the transcoder, tear the
    /// manifest down, and re-initialize from the current global time
    /// exactly as a hard seek would.
    #[instrument(skip(self))]
    pub async fn switch_audio_track(&self, index: u32) -> Result<()> {
        let resume_at = self.global_time();

        self.transcoder.switch_audio(&self.session_id, index).await?;
        self.surface.detach();
        self.set_state(ManifestState::Loading).await?;

        let seek_id = SeekId::new();
        *self.current_seek.write().await = Some(seek_id);
        let url = self
            .transcoder
            .seek_manifest_url(&self.session_id, resume_at, seek_id)?;

        let slice = match self.fetch_with_retries(&url).await {
            Ok(slice) => slice,
            Err(err) => return Err(self.fail(err).await),
        };
        if let Err(err) = self.attach_with_recovery(&slice).await {
            return Err(self.fail(err).await);
        }

        self.set_offset(slice.slice_start.unwrap_or(resume_at));
        *self.current_seek.write().await = None;
        self.set_state(ManifestState::Ready).await?;
        self.bump_reslice();

        info!(index, resume_at, "Audio track switched");
        Ok(())
    }

    /// Fetch a manifest, retrying transient network failures up to the
    /// configured cap. Exceeding the cap is fatal.
    async fn fetch_with_retries(&self, url: &Url) -> Result<ManifestSlice> {
        loop {
            match self.transcoder.load_manifest(url).await {
                Ok(slice) => return Ok(slice),
                Err(err) => {
                    let retries = self.network_retries.fetch_add(1, Ordering::SeqCst) + 1;
                    if retries > self.config.network_retry_cap {
                        return Err(Error::ManifestNetwork {
                            message: "Network error".to_string(),
                            detail: "Failed to load stream after multiple retries. \
                                     Please try again or select another stream."
                                .to_string(),
                        });
                    }
                    warn!(
                        retries,
                        cap = self.config.network_retry_cap,
                        error = %err,
                        "Fatal network error, retrying"
                    );
                    tokio::time::sleep(self.config.network_retry_delay).await;
                }
            }
        }
    }

    /// Attach a slice, recovering media errors via decoder reset up to
    /// the configured cap. Exceeding the cap is fatal.
    async fn attach_with_recovery(&self, slice: &ManifestSlice) -> Result<()> {
        loop {
            match self.surface.attach(slice).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let retries = self.media_retries.fetch_add(1, Ordering::SeqCst) + 1;
                    if retries > self.config.media_retry_cap {
                        return Err(Error::ManifestMedia {
                            message: "Media error".to_string(),
                            detail: "Failed to decode stream. Please try another stream."
                                .to_string(),
                        });
                    }
                    warn!(
                        retries,
                        cap = self.config.media_retry_cap,
                        error = %err,
                        "Fatal media error, recovering"
                    );
                    self.surface.reset_decoder().await?;
                }
            }
        }
    }

    /// Tear down the manifest attachment without notifying the server
    pub async fn teardown(&self) {
        self.surface.detach();
        *self.current_seek.write().await = None;
    }
}

#[async_trait]
impl PlaybackControl for ManifestController {
    fn current_time(&self) -> f64 {
        self.global_time()
    }

    async fn seek(&self, target_global: f64) -> Result<()> {
        ManifestController::seek(self, target_global).await.map(|_| ())
    }

    async fn play(&self) -> Result<()> {
        self.surface.play().await
    }

    fn pause(&self) {
        self.surface.pause();
    }

    fn is_paused(&self) -> bool {
        self.surface.is_paused()
    }
}
