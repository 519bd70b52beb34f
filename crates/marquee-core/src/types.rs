//! Core types for the Marquee playback engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Classification of a stream source, derived from the source string shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Torrent,
    Http,
}

impl SourceKind {
    /// Derive the kind from the raw source string
    pub fn from_source(source: &str) -> Self {
        if source.starts_with("magnet:") {
            SourceKind::Torrent
        } else {
            SourceKind::Http
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Torrent => write!(f, "torrent"),
            SourceKind::Http => write!(f, "http"),
        }
    }
}

/// Unique identifier for a single hard-seek attempt.
///
/// Stale manifest responses are disambiguated by comparing their seek id
/// against the most recent one issued by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeekId(pub Uuid);

impl SeekId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SeekId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SeekId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Embedded audio track reported by the transcoder probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    /// Embedded stream index on the transcoder side
    pub index: u32,
    /// Human-readable label
    pub label: String,
    /// Language code if reported
    pub language: Option<String>,
    /// Currently selected track
    pub selected: bool,
}

/// Where a subtitle track's payload comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleOrigin {
    /// Extracted by the transcoder; payload is served relative to the
    /// session timeline and accepts a `startTime` query
    Embedded,
    /// Fetched from a subtitle addon
    Addon,
    /// Loaded from a local file
    LocalFile,
}

/// Caption payload grammar. Selected once per track, never re-detected
/// per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptionFormat {
    /// `HH:MM:SS.mmm` / `MM:SS.mmm` timestamps, times already relative
    Vtt,
    /// `HH:MM:SS,mmm` timestamps, times absolute in file
    Srt,
}

impl CaptionFormat {
    /// Guess the format from a payload URL when the track does not
    /// declare one
    pub fn from_url_hint(url: &str) -> Self {
        if url.ends_with(".srt") || url.contains("subencoding") {
            CaptionFormat::Srt
        } else {
            CaptionFormat::Vtt
        }
    }
}

/// A selectable subtitle track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    /// Stable identifier; the sentinel `"off"` disables captions
    pub id: String,
    pub label: String,
    pub language: Option<String>,
    /// Payload URL; absent for the off sentinel
    pub url: Option<Url>,
    pub origin: SubtitleOrigin,
    /// Declared format; resolved from the URL hint when absent
    pub format: Option<CaptionFormat>,
    pub selected: bool,
}

impl SubtitleTrack {
    /// The "captions disabled" sentinel
    pub fn off() -> Self {
        Self {
            id: "off".to_string(),
            label: "Off".to_string(),
            language: None,
            url: None,
            origin: SubtitleOrigin::Embedded,
            format: None,
            selected: true,
        }
    }

    pub fn is_off(&self) -> bool {
        self.id == "off"
    }

    /// Resolved caption format for this track
    pub fn resolved_format(&self) -> CaptionFormat {
        if let Some(format) = self.format {
            return format;
        }
        self.url
            .as_ref()
            .map(|u| CaptionFormat::from_url_hint(u.as_str()))
            .unwrap_or(CaptionFormat::Vtt)
    }
}

/// A track of either kind, discriminated for heterogeneous lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Track {
    Audio(AudioTrack),
    Subtitle(SubtitleTrack),
}

/// A parsed caption cue in manifest-relative seconds, before the user
/// delay is applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl Cue {
    /// Cue re-stamped with the user delay applied
    pub fn shifted(&self, delay: f64) -> Cue {
        Cue {
            start: self.start + delay,
            end: self.end + delay,
            text: self.text.clone(),
        }
    }

    /// Whether the (already shifted) cue is visible at the given time
    pub fn is_active_at(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }
}

/// Chapter marker reported by the transcoder probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    #[serde(rename = "startSeconds")]
    pub start_seconds: f64,
    #[serde(rename = "endSeconds")]
    pub end_seconds: f64,
}

/// A negotiated playback session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Server-assigned session id
    pub id: String,
    /// Total duration; zero while a torrent is still fetching metadata
    pub duration_seconds: f64,
    /// Embedded tracks discovered by the probe
    pub embedded_tracks: Vec<Track>,
    /// Index of the active embedded audio stream
    pub audio_index: u32,
    pub chapters: Vec<Chapter>,
    pub torrent_info_hash: Option<String>,
}

/// Manifest controller state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManifestState {
    /// No manifest loaded
    Idle,
    /// Initial manifest load (or track-switch re-entry) in progress
    Loading,
    /// Manifest parsed, playback possible
    Ready,
    /// Seek satisfied from buffered media
    SeekingSoft,
    /// Fresh slice requested from the transcoder
    SeekingHard,
    /// Fatal error, retry re-runs the whole session setup
    Error,
}

impl ManifestState {
    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: ManifestState) -> bool {
        use ManifestState::*;
        if self != &Error && target == Error {
            return true;
        }
        matches!(
            (self, target),
            (Idle, Loading)
                | (Loading, Ready)
                | (Ready, SeekingSoft)
                | (Ready, SeekingHard)
                | (Ready, Loading)
                | (SeekingSoft, Ready)
                | (SeekingHard, Ready)
                | (SeekingHard, SeekingHard)
        )
    }
}

impl std::fmt::Display for ManifestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestState::Idle => write!(f, "idle"),
            ManifestState::Loading => write!(f, "loading"),
            ManifestState::Ready => write!(f, "ready"),
            ManifestState::SeekingSoft => write!(f, "seeking-soft"),
            ManifestState::SeekingHard => write!(f, "seeking-hard"),
            ManifestState::Error => write!(f, "error"),
        }
    }
}

/// Result of a completed seek request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekOutcome {
    /// Satisfied from buffered media, no server request issued
    Soft,
    /// A fresh slice was loaded; offset is the authoritative slice start
    Hard { offset: f64 },
    /// A newer seek superseded this one before it resolved
    Superseded,
}

/// Watch party row. State fields are written only by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchParty {
    pub party_id: String,
    pub host_id: String,
    pub imdb_id: String,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub stream_source: String,
    pub file_idx: Option<u32>,
    pub current_time_seconds: f64,
    pub is_playing: bool,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WatchParty {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Watch party membership row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchPartyMember {
    pub party_id: String,
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Tolerance when deciding whether a seek target is buffered (seconds)
    pub buffered_tolerance: f64,
    /// Fatal network errors retried up to this cap
    pub network_retry_cap: u32,
    /// Fatal media errors recovered via decoder reset up to this cap
    pub media_retry_cap: u32,
    /// Delay between manifest network retries
    pub network_retry_delay: Duration,
    /// A session that never reaches Ready within this window is fatal
    pub startup_timeout: Duration,
    /// Attempts polling for a duration while torrent metadata arrives
    pub duration_poll_attempts: u32,
    /// Interval between duration polls
    pub duration_poll_interval: Duration,
    /// Watch party liveness heartbeat interval
    pub heartbeat_interval: Duration,
    /// Participant drift past this threshold triggers a corrective seek (seconds)
    pub drift_threshold: f64,
    /// Subtitle carry-over buffer force-flushed past this size (bytes)
    pub subtitle_flush_bytes: usize,
    /// Watch party time-to-live from creation
    pub party_ttl: Duration,
    /// HTTP request timeout
    pub request_timeout: Duration,
    /// Fallback subtitle language when audio language gives no match
    pub default_subtitle_language: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffered_tolerance: 0.5,
            network_retry_cap: 5,
            media_retry_cap: 3,
            network_retry_delay: Duration::from_secs(1),
            startup_timeout: Duration::from_secs(60),
            duration_poll_attempts: 18,
            duration_poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            drift_threshold: 2.0,
            subtitle_flush_bytes: 5000,
            party_ttl: Duration::from_secs(8 * 60 * 60),
            request_timeout: Duration::from_secs(10),
            default_subtitle_language: "en".to_string(),
        }
    }
}
