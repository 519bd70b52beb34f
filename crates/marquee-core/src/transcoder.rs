//! Transcoder HTTP client
//!
//! Typed client for the remote transcoding server that owns playback
//! sessions. The engine consumes this surface; it never produces it.
//!
//! Slice-start semantics: a manifest response carries the authoritative
//! start time of the slice in the `X-Raffi-Slice-Start` header. That
//! value (not the requested seek target) becomes the playback offset,
//! since the server may align slices to keyframe boundaries.

use crate::error::{Error, Result};
use crate::types::{Chapter, SeekId, SourceKind};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Response header carrying the authoritative slice start in seconds
pub const SLICE_START_HEADER: &str = "X-Raffi-Slice-Start";

/// Session creation request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest<'a> {
    pub source: &'a str,
    pub kind: SourceKind,
    pub start_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_idx: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct CreatedSession {
    id: String,
}

/// Embedded stream reported by the transcoder probe
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProbedStream {
    pub index: u32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Session metadata returned by `GET /sessions/{id}`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    #[serde(default)]
    pub available_streams: Vec<ProbedStream>,
    #[serde(default)]
    pub audio_index: u32,
    #[serde(default)]
    pub torrent_info_hash: Option<String>,
    #[serde(default)]
    pub is_torrent: bool,
}

/// Clip extraction request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipRequest {
    pub start: f64,
    pub end: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipResponse {
    pub output_path: String,
}

/// A fetched manifest slice
#[derive(Debug, Clone)]
pub struct ManifestSlice {
    /// Authoritative slice start from the response header, if present
    pub slice_start: Option<f64>,
    /// Raw playlist body, handed to the media surface for ingestion
    pub body: String,
}

/// Client for the transcoder HTTP surface
#[derive(Debug, Clone)]
pub struct TranscoderClient {
    base_url: Url,
    client: Client,
}

impl TranscoderClient {
    /// Create a client against the given transcoder base URL
    pub fn new(base_url: Url, request_timeout: Duration) -> Self {
        Self {
            base_url,
            client: Client::builder()
                .timeout(request_timeout)
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    /// Negotiate a new playback session. Failure here is fatal to the
    /// playback attempt and is not retried.
    pub async fn create_session(
        &self,
        source: &str,
        kind: SourceKind,
        start_time: f64,
        file_idx: Option<u32>,
    ) -> Result<String> {
        let url = self.url("sessions")?;
        let body = CreateSessionRequest {
            source,
            kind,
            start_time,
            file_idx,
        };

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::SessionCreateFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::SessionCreateFailed(format!(
                "transcoder returned {}",
                response.status()
            )));
        }

        let created: CreatedSession = response
            .json()
            .await
            .map_err(|e| Error::SessionCreateFailed(e.to_string()))?;

        debug!(session_id = %created.id, %kind, "Session created");
        Ok(created.id)
    }

    /// Fetch session metadata (duration, embedded tracks, chapters)
    pub async fn session_info(&self, session_id: &str) -> Result<SessionInfo> {
        let url = self.url(&format!("sessions/{session_id}"))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::SessionInfoFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::SessionInfoFailed(format!(
                "transcoder returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::SessionInfoFailed(e.to_string()))
    }

    /// URL of the session's child playlist without seek parameters
    pub fn manifest_url(&self, session_id: &str) -> Result<Url> {
        self.url(&format!("sessions/{session_id}/stream/child.m3u8"))
    }

    /// URL requesting a freshly sliced manifest at the given global time.
    ///
    /// The seek id rides along so stale responses from superseded seeks
    /// can be recognized and dropped.
    pub fn seek_manifest_url(&self, session_id: &str, seek: f64, seek_id: SeekId) -> Result<Url> {
        let mut url = self.manifest_url(session_id)?;
        url.query_pairs_mut()
            .append_pair("seek", &format!("{}", seek.floor() as u64))
            .append_pair("seek_id", &seek_id.to_string())
            .append_pair("force_slice", "1");
        Ok(url)
    }

    /// Fetch a manifest slice, extracting the authoritative slice start
    pub async fn load_manifest(&self, url: &Url) -> Result<ManifestSlice> {
        let response = self.client.get(url.clone()).send().await?;

        if !response.status().is_success() {
            return Err(Error::ManifestNetwork {
                message: "Network error".to_string(),
                detail: format!("manifest request returned {}", response.status()),
            });
        }

        let slice_start = response
            .headers()
            .get(SLICE_START_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                let parsed = v.parse::<f64>().ok();
                if parsed.is_none() {
                    warn!(header = v, "Invalid slice start header");
                }
                parsed
            });

        let body = response.text().await?;
        Ok(ManifestSlice { slice_start, body })
    }

    /// Payload URL for a subtitle stream extracted by the transcoder.
    /// The payload is served relative to the requested `startTime`.
    pub fn subtitle_url(&self, session_id: &str, index: u32) -> Result<Url> {
        self.url(&format!("sessions/{session_id}/subtitles/{index}.vtt"))
    }

    /// Switch the embedded audio track server-side
    pub async fn switch_audio(&self, session_id: &str, index: u32) -> Result<()> {
        let url = self.url(&format!("sessions/{session_id}/audio"))?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "index": index }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "audio switch returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Extract a clip from the current session
    pub async fn clip(&self, session_id: &str, request: &ClipRequest) -> Result<ClipResponse> {
        let url = self.url(&format!("sessions/{session_id}/clip"))?;
        let response = self.client.post(url).json(request).send().await?;

        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "clip request returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Notify the transcoder that the session is done.
    ///
    /// Beacon semantics: spawned and never awaited. Losing the request
    /// on abrupt process termination is acceptable.
    pub fn cleanup(&self, session_id: &str) {
        let url = match self.url(&format!("cleanup?id={session_id}")) {
            Ok(url) => url,
            Err(_) => return,
        };
        let client = self.client.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = client.post(url).send().await {
                debug!(session_id, error = %err, "Cleanup beacon failed");
            }
        });
    }
}
