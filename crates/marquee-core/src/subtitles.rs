//! Caption fetch, incremental parse, and time-shifted rendering
//!
//! Cues are stored in manifest-relative seconds. Rendering applies the
//! persisted user delay on top, so a delay change re-stamps every cue
//! without re-fetching the payload. Tracks extracted by the transcoder
//! serve absolute-in-file timestamps and are rebased against the
//! playback offset captured when the fetch began.
//!
//! Cancellation is a generation counter: every selection bumps it, and
//! a fetch task checks its own generation before each append, so late
//! chunks from a superseded fetch inject nothing.

use crate::error::{Error, Result};
use crate::types::{CaptionFormat, Cue, EngineConfig, SubtitleOrigin, SubtitleTrack};
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Persistence seam for the user's global caption delay
pub trait DelayStore: Send + Sync {
    fn load(&self) -> Option<f64>;
    fn save(&self, delay: f64);
}

/// In-memory delay store, the default when the shell persists nothing
#[derive(Debug, Default)]
pub struct MemoryDelayStore(std::sync::Mutex<Option<f64>>);

impl DelayStore for MemoryDelayStore {
    fn load(&self) -> Option<f64> {
        *self.0.lock().unwrap()
    }

    fn save(&self, delay: f64) {
        *self.0.lock().unwrap() = Some(delay);
    }
}

/// Line position for rendered cues given on-screen control visibility.
/// Pure layout math, never triggers a fetch.
pub fn recompute_line_position(controls_visible: bool) -> i32 {
    if controls_visible {
        -4
    } else {
        -2
    }
}

#[derive(Debug, Deserialize)]
struct AddonSubtitlesResponse {
    #[serde(default)]
    subtitles: Vec<AddonSubtitle>,
}

#[derive(Debug, Deserialize)]
struct AddonSubtitle {
    id: String,
    #[serde(default)]
    lang: Option<String>,
    url: String,
}

/// Incremental block parser for caption payloads.
///
/// Blocks are separated by blank lines; a partial trailing block is
/// carried over until its separator arrives. The grammar is fixed at
/// construction and never re-detected per block.
struct CueParser {
    format: CaptionFormat,
    /// Playback offset captured when the fetch began; rebases
    /// absolute-in-file timestamps
    offset: f64,
    flush_bytes: usize,
    carry: String,
    /// Undecoded tail of the last byte chunk, split mid-codepoint
    pending: Vec<u8>,
}

impl CueParser {
    fn new(format: CaptionFormat, offset: f64, flush_bytes: usize) -> Self {
        Self {
            format,
            offset,
            flush_bytes,
            carry: String::new(),
            pending: Vec::new(),
        }
    }

    /// Feed a byte chunk, returning every cue completed by it.
    ///
    /// Only an incomplete multi-byte suffix is held back for the next
    /// chunk; invalid sequences become U+FFFD and decoding continues.
    fn push_bytes(&mut self, chunk: &[u8]) -> Vec<Cue> {
        self.pending.extend_from_slice(chunk);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    text.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        self.push(&text)
    }

    fn push(&mut self, chunk: &str) -> Vec<Cue> {
        self.carry.push_str(chunk);
        if self.carry.contains('\r') {
            self.carry = self.carry.replace("\r\n", "\n");
        }

        let mut cues = Vec::new();
        while let Some(pos) = self.carry.find("\n\n") {
            // The separator delimits the block; it is not part of it
            let block = self.carry[..pos].to_string();
            self.carry.drain(..pos + 2);
            if let Some(cue) = self.parse_block(&block) {
                cues.push(cue);
            }
        }

        // A runaway block without separators is flushed as a best-effort
        // cue rather than buffered forever
        if self.carry.len() > self.flush_bytes {
            let block = std::mem::take(&mut self.carry);
            if let Some(cue) = self.parse_block(&block) {
                cues.push(cue);
            }
        }

        cues
    }

    /// Parse whatever remains once the stream ends
    fn finish(&mut self) -> Vec<Cue> {
        let block = std::mem::take(&mut self.carry);
        self.parse_block(&block).into_iter().collect()
    }

    /// A block needs a `start --> end` timing line; lines before it are
    /// index lines and ignored, lines after it are the cue text.
    fn parse_block(&self, block: &str) -> Option<Cue> {
        let mut lines = block.lines();
        let timing = lines.find(|l| l.contains("-->"))?;

        let (start_raw, end_raw) = timing.split_once("-->")?;
        let start = parse_timestamp(start_raw)?;
        let end = parse_timestamp(end_raw)?;

        let text = lines.collect::<Vec<_>>().join("\n");
        if text.trim().is_empty() {
            return None;
        }

        let (start, end) = match self.format {
            CaptionFormat::Vtt => (start, end),
            CaptionFormat::Srt => (start - self.offset, end - self.offset),
        };

        Some(Cue { start, end, text })
    }
}

/// Parse `HH:MM:SS.mmm`, `MM:SS.mmm`, or the comma-millisecond variant
fn parse_timestamp(raw: &str) -> Option<f64> {
    let token = raw.split_whitespace().next()?.replace(',', ".");
    let parts: Vec<&str> = token.split(':').collect();
    let (h, m, s) = match parts.as_slice() {
        [h, m, s] => (h.parse::<f64>().ok()?, m.parse::<f64>().ok()?, s.parse::<f64>().ok()?),
        [m, s] => (0.0, m.parse::<f64>().ok()?, s.parse::<f64>().ok()?),
        _ => return None,
    };
    Some(h * 3600.0 + m * 60.0 + s)
}

/// Strip markup tags and decode the entities subtitle payloads carry
fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Fetches, parses, and renders caption tracks for one playback attempt
pub struct SubtitleEngine {
    client: Client,
    config: EngineConfig,
    tracks: Arc<RwLock<Vec<SubtitleTrack>>>,
    /// Manifest-relative cues for the selected track, before delay
    cues: Arc<RwLock<Vec<Cue>>>,
    delay: Arc<RwLock<f64>>,
    cues_tx: Arc<watch::Sender<Vec<Cue>>>,
    generation: Arc<AtomicU64>,
    fetch_task: Mutex<Option<JoinHandle<()>>>,
    offset_rx: watch::Receiver<f64>,
    delay_store: Arc<dyn DelayStore>,
    /// An explicit user choice (including "off") disables auto-selection
    user_selected: Arc<RwLock<bool>>,
}

impl SubtitleEngine {
    pub fn new(
        offset_rx: watch::Receiver<f64>,
        delay_store: Arc<dyn DelayStore>,
        config: EngineConfig,
    ) -> Self {
        let (cues_tx, _) = watch::channel(Vec::new());
        let delay = delay_store.load().unwrap_or(0.0);
        Self {
            client: Client::builder()
                .timeout(config.request_timeout)
                .build()
                .expect("Failed to create HTTP client"),
            config,
            tracks: Arc::new(RwLock::new(vec![SubtitleTrack::off()])),
            cues: Arc::new(RwLock::new(Vec::new())),
            delay: Arc::new(RwLock::new(delay)),
            cues_tx: Arc::new(cues_tx),
            generation: Arc::new(AtomicU64::new(0)),
            fetch_task: Mutex::new(None),
            offset_rx,
            delay_store,
            user_selected: Arc::new(RwLock::new(false)),
        }
    }

    /// Replace the track list (session start). The off sentinel is
    /// always present and selected initially.
    pub async fn set_tracks(&self, tracks: Vec<SubtitleTrack>) {
        let mut list = vec![SubtitleTrack::off()];
        list.extend(tracks.into_iter().filter(|t| !t.is_off()));
        *self.tracks.write().await = list;
    }

    pub async fn tracks(&self) -> Vec<SubtitleTrack> {
        self.tracks.read().await.clone()
    }

    pub async fn selected_track(&self) -> Option<SubtitleTrack> {
        self.tracks.read().await.iter().find(|t| t.selected).cloned()
    }

    /// Observe rendered cues (delay applied, markup stripped)
    pub fn subscribe_cues(&self) -> watch::Receiver<Vec<Cue>> {
        self.cues_tx.subscribe()
    }

    pub async fn current_delay(&self) -> f64 {
        *self.delay.read().await
    }

    /// Select a track by id. An explicit user choice, including "off",
    /// suppresses auto-selection for the rest of the session.
    #[instrument(skip(self))]
    pub async fn select_track(&self, track_id: &str) -> Result<()> {
        *self.user_selected.write().await = true;
        self.activate(track_id).await
    }

    /// Pick a track at session start: prefer the active audio language,
    /// fall back to the default language. Never overrides an explicit
    /// user choice.
    #[instrument(skip(self))]
    pub async fn auto_select(&self, audio_language: Option<&str>) -> Result<()> {
        if *self.user_selected.read().await {
            return Ok(());
        }

        let tracks = self.tracks.read().await.clone();
        let by_language = |lang: &str| {
            tracks
                .iter()
                .find(|t| !t.is_off() && t.language.as_deref() == Some(lang))
        };

        let pick = audio_language
            .and_then(by_language)
            .or_else(|| by_language(&self.config.default_subtitle_language));

        match pick {
            Some(track) => {
                let id = track.id.clone();
                debug!(track_id = %id, "Auto-selected subtitle track");
                self.activate(&id).await
            }
            None => Ok(()),
        }
    }

    async fn activate(&self, track_id: &str) -> Result<()> {
        let track = {
            let tracks = self.tracks.read().await;
            let track = tracks
                .iter()
                .find(|t| t.id == track_id)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("unknown subtitle track {track_id}")))?;
            if track.selected {
                return Ok(());
            }
            track
        };

        {
            let mut tracks = self.tracks.write().await;
            for t in tracks.iter_mut() {
                t.selected = t.id == track.id;
            }
        }

        self.abort_fetch().await;
        self.cues.write().await.clear();
        self.cues_tx.send_replace(Vec::new());

        if track.is_off() {
            info!("Captions disabled");
            return Ok(());
        }

        info!(track_id = %track.id, format = ?track.resolved_format(), "Subtitle track selected");
        self.start_fetch(track).await
    }

    /// Re-fetch the selected track against the current offset. Called
    /// after a completed hard seek re-slices the manifest.
    pub async fn refetch_selected(&self) -> Result<()> {
        match self.selected_track().await {
            Some(track) if !track.is_off() => {
                self.abort_fetch().await;
                self.cues.write().await.clear();
                self.start_fetch(track).await
            }
            _ => Ok(()),
        }
    }

    /// Set the global caption delay: persist it and re-stamp every cue.
    /// No re-fetch.
    pub async fn apply_delay(&self, seconds: f64) {
        *self.delay.write().await = seconds;
        self.delay_store.save(seconds);
        self.render().await;
        debug!(seconds, "Caption delay applied");
    }

    /// Abort any in-flight fetch; late chunks from it inject nothing
    pub async fn abort_fetch(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.fetch_task.lock().await.take() {
            task.abort();
        }
    }

    /// Discover addon-provided tracks for the given media item. Series
    /// resources are addressed as `imdb:season:episode`. Per-addon
    /// failures are logged and skipped.
    #[instrument(skip(self, addons))]
    pub async fn discover_addon_tracks(
        &self,
        addons: &[Url],
        media_type: &str,
        imdb_id: &str,
        season: Option<u32>,
        episode: Option<u32>,
    ) -> usize {
        let resource_id = match (season, episode) {
            (Some(s), Some(e)) => format!("{imdb_id}:{s}:{e}"),
            _ => imdb_id.to_string(),
        };

        let mut added = 0;
        for addon in addons {
            let url = match addon.join(&format!("subtitles/{media_type}/{resource_id}.json")) {
                Ok(url) => url,
                Err(err) => {
                    warn!(addon = %addon, error = %err, "Invalid addon subtitle URL");
                    continue;
                }
            };

            let response = match self.client.get(url).send().await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    warn!(addon = %addon, status = %r.status(), "Addon subtitles request failed");
                    continue;
                }
                Err(err) => {
                    warn!(addon = %addon, error = %err, "Addon subtitles request failed");
                    continue;
                }
            };

            let payload: AddonSubtitlesResponse = match response.json().await {
                Ok(p) => p,
                Err(err) => {
                    warn!(addon = %addon, error = %err, "Addon subtitles payload invalid");
                    continue;
                }
            };

            let mut tracks = self.tracks.write().await;
            for sub in payload.subtitles {
                let payload_url = match Url::parse(&sub.url) {
                    Ok(u) => u,
                    Err(_) => continue,
                };
                if tracks.iter().any(|t| t.id == sub.id) {
                    continue;
                }
                tracks.push(SubtitleTrack {
                    id: sub.id,
                    label: sub.lang.clone().unwrap_or_else(|| "Unknown".to_string()),
                    language: sub.lang,
                    format: Some(CaptionFormat::from_url_hint(payload_url.as_str())),
                    url: Some(payload_url),
                    origin: SubtitleOrigin::Addon,
                    selected: false,
                });
                added += 1;
            }
        }

        debug!(added, "Addon subtitle discovery finished");
        added
    }

    async fn start_fetch(&self, track: SubtitleTrack) -> Result<()> {
        let mut url = track
            .url
            .clone()
            .ok_or_else(|| Error::SubtitleFetchFailed("track has no payload URL".to_string()))?;

        let offset = *self.offset_rx.borrow();
        // Transcoder-extracted tracks serve payloads relative to the
        // requested start time
        if track.origin == SubtitleOrigin::Embedded {
            url.query_pairs_mut()
                .append_pair("startTime", &format!("{}", offset.floor() as u64));
        }

        let generation = self.generation.clone();
        let gen = generation.load(Ordering::SeqCst);
        let format = track.resolved_format();
        let client = self.client.clone();
        let cues = self.cues.clone();
        let delay = self.delay.clone();
        let cues_tx = self.cues_tx.clone();
        let flush_bytes = self.config.subtitle_flush_bytes;

        let handle = tokio::spawn(async move {
            let result = fetch_cues(
                client, url, format, offset, flush_bytes, gen, generation, cues, delay, cues_tx,
            )
            .await;
            match result {
                Ok(()) => {}
                Err(err) if err.is_aborted() => {
                    debug!("Subtitle fetch aborted");
                }
                Err(err) => {
                    // Degrades to no captions; playback continues
                    warn!(error = %err, "Subtitle fetch failed");
                }
            }
        });

        *self.fetch_task.lock().await = Some(handle);
        Ok(())
    }

    async fn render(&self) {
        let delay = *self.delay.read().await;
        let raw = self.cues.read().await;
        // send_replace stores the render even with no live receivers
        self.cues_tx.send_replace(render_cues(&raw, delay));
    }
}

/// Delay applied, markup stripped, cues ending before zero dropped
fn render_cues(raw: &[Cue], delay: f64) -> Vec<Cue> {
    raw.iter()
        .map(|c| {
            let mut cue = c.shifted(delay);
            cue.text = strip_markup(&cue.text);
            cue
        })
        .filter(|c| c.end >= 0.0)
        .collect()
}

#[allow(clippy::too_many_arguments)]
async fn fetch_cues(
    client: Client,
    url: Url,
    format: CaptionFormat,
    offset: f64,
    flush_bytes: usize,
    gen: u64,
    generation: Arc<AtomicU64>,
    cues: Arc<RwLock<Vec<Cue>>>,
    delay: Arc<RwLock<f64>>,
    cues_tx: Arc<watch::Sender<Vec<Cue>>>,
) -> Result<()> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::SubtitleFetchFailed(e.to_string()))?;

    if !response.status().is_success() {
        return Err(Error::SubtitleFetchFailed(format!(
            "payload request returned {}",
            response.status()
        )));
    }

    let mut parser = CueParser::new(format, offset, flush_bytes);
    let mut stream = response.bytes_stream();
    let mut total = 0usize;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::SubtitleFetchFailed(e.to_string()))?;
        let batch = parser.push_bytes(&chunk);
        total += batch.len();
        append_cues(gen, &generation, &cues, &delay, &cues_tx, batch).await?;
    }

    let batch = parser.finish();
    total += batch.len();
    append_cues(gen, &generation, &cues, &delay, &cues_tx, batch).await?;

    debug!(total, "Subtitle fetch complete");
    Ok(())
}

/// Append a batch iff this fetch is still the current one
async fn append_cues(
    gen: u64,
    generation: &AtomicU64,
    cues: &RwLock<Vec<Cue>>,
    delay: &RwLock<f64>,
    cues_tx: &watch::Sender<Vec<Cue>>,
    batch: Vec<Cue>,
) -> Result<()> {
    if generation.load(Ordering::SeqCst) != gen {
        return Err(Error::SubtitleFetchAborted);
    }
    if batch.is_empty() {
        return Ok(());
    }

    let mut raw = cues.write().await;
    // Re-check under the lock so an abort racing the append still wins
    if generation.load(Ordering::SeqCst) != gen {
        return Err(Error::SubtitleFetchAborted);
    }
    raw.extend(batch);
    cues_tx.send_replace(render_cues(&raw, *delay.read().await));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine_with_offset(offset: f64) -> (SubtitleEngine, watch::Sender<f64>) {
        let (offset_tx, offset_rx) = watch::channel(offset);
        let engine = SubtitleEngine::new(
            offset_rx,
            Arc::new(MemoryDelayStore::default()),
            EngineConfig::default(),
        );
        (engine, offset_tx)
    }

    #[test]
    fn test_vtt_incremental_parse() {
        let mut parser = CueParser::new(CaptionFormat::Vtt, 0.0, 5000);

        // Chunk boundary lands mid-block
        let first = parser.push("WEBVTT\n\n00:10.000 --> 00:12.500\nHello");
        assert!(first.is_empty());

        let second = parser.push(" there\n\n00:01:00.000 --> 00:01:02.000 position:10%\nSecond\n\n");
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].start, 10.0);
        assert_eq!(second[0].end, 12.5);
        assert_eq!(second[0].text, "Hello there");
        assert_eq!(second[1].start, 60.0);
        assert_eq!(second[1].text, "Second");
    }

    #[test]
    fn test_srt_rebases_against_offset() {
        let mut parser = CueParser::new(CaptionFormat::Srt, 880.0, 5000);
        let cues = parser.push("1\n00:15:00,000 --> 00:15:02,500\nLine one\nLine two\n\n");
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].start, 20.0);
        assert_eq!(cues[0].end, 22.5);
        assert_eq!(cues[0].text, "Line one\nLine two");
    }

    #[test]
    fn test_trailing_block_parsed_on_finish() {
        let mut parser = CueParser::new(CaptionFormat::Srt, 0.0, 5000);
        assert!(parser.push("3\n00:00:05,000 --> 00:00:07,000\nTail").is_empty());
        let cues = parser.finish();
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "Tail");
    }

    #[test]
    fn test_oversized_carry_is_force_flushed() {
        let mut parser = CueParser::new(CaptionFormat::Vtt, 0.0, 64);
        let big_text = "x".repeat(100);
        let cues = parser.push(&format!("00:01.000 --> 00:03.000\n{big_text}"));
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, big_text);
        assert!(parser.carry.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_replaced_not_fatal() {
        let mut parser = CueParser::new(CaptionFormat::Srt, 0.0, 5000);

        let mut payload = b"1\n00:00:01,000 --> 00:00:02,000\nfirst\xFF\n\n".to_vec();
        payload.extend_from_slice(b"2\n00:00:03,000 --> 00:00:04,000\nsecond\n\n");

        let cues = parser.push_bytes(&payload);
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].text, "first\u{FFFD}");
        assert_eq!(cues[1].text, "second");
        assert!(parser.pending.is_empty());
    }

    #[test]
    fn test_codepoint_split_across_chunks() {
        let mut parser = CueParser::new(CaptionFormat::Vtt, 0.0, 5000);

        // "é" is two bytes; the head ends between them
        let payload = "00:01.000 --> 00:02.000\ncafé\n\n".as_bytes();
        let (head, tail) = payload.split_at(payload.len() - 3);

        assert!(parser.push_bytes(head).is_empty());
        let cues = parser.push_bytes(tail);
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "café");
    }

    #[test]
    fn test_crlf_and_comma_millis() {
        let mut parser = CueParser::new(CaptionFormat::Srt, 0.0, 5000);
        let cues = parser.push("1\r\n00:00:01,500 --> 00:00:03,000\r\nCarriage\r\n\r\n");
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].start, 1.5);
        assert_eq!(cues[0].end, 3.0);
    }

    #[test]
    fn test_render_strips_markup_and_drops_negative() {
        let raw = vec![
            Cue {
                start: -30.0,
                end: -28.0,
                text: "before the slice".into(),
            },
            Cue {
                start: 5.0,
                end: 7.0,
                text: "<i>styled&nbsp;&amp;&nbsp;tagged</i>".into(),
            },
        ];
        let rendered = render_cues(&raw, 0.0);
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].text, "styled & tagged");

        // A large positive delay revives the early cue
        let rendered = render_cues(&raw, 30.0);
        assert_eq!(rendered.len(), 2);
    }

    #[test]
    fn test_line_position_is_pure() {
        assert_eq!(recompute_line_position(true), -4);
        assert_eq!(recompute_line_position(false), -2);
    }

    #[tokio::test]
    async fn test_select_off_is_noop_and_explicit() {
        let (engine, _offset) = engine_with_offset(0.0);

        // Off is already selected; reselecting it is a no-op but still
        // counts as an explicit choice
        engine.select_track("off").await.unwrap();
        assert!(*engine.user_selected.read().await);

        engine.auto_select(Some("en")).await.unwrap();
        let selected = engine.selected_track().await.unwrap();
        assert!(selected.is_off());
    }

    #[tokio::test]
    async fn test_auto_select_prefers_audio_language() {
        let (engine, _offset) = engine_with_offset(0.0);
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Any)
            .with_body("WEBVTT\n\n00:01.000 --> 00:02.000\nhi\n\n")
            .create_async()
            .await;

        let track = |id: &str, lang: &str| SubtitleTrack {
            id: id.to_string(),
            label: lang.to_string(),
            language: Some(lang.to_string()),
            url: Some(Url::parse(&format!("{}/{id}.vtt", server.url())).unwrap()),
            origin: SubtitleOrigin::Addon,
            format: Some(CaptionFormat::Vtt),
            selected: false,
        };
        engine
            .set_tracks(vec![track("sub-en", "en"), track("sub-ja", "ja")])
            .await;

        engine.auto_select(Some("ja")).await.unwrap();
        assert_eq!(engine.selected_track().await.unwrap().id, "sub-ja");
    }

    #[tokio::test]
    async fn test_auto_select_falls_back_to_default_language() {
        let (engine, _offset) = engine_with_offset(0.0);
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Any)
            .with_body("WEBVTT\n\n00:01.000 --> 00:02.000\nhi\n\n")
            .create_async()
            .await;

        let track = SubtitleTrack {
            id: "sub-en".to_string(),
            label: "en".to_string(),
            language: Some("en".to_string()),
            url: Some(Url::parse(&format!("{}/en.vtt", server.url())).unwrap()),
            origin: SubtitleOrigin::Addon,
            format: Some(CaptionFormat::Vtt),
            selected: false,
        };
        engine.set_tracks(vec![track]).await;

        engine.auto_select(Some("fr")).await.unwrap();
        assert_eq!(engine.selected_track().await.unwrap().id, "sub-en");
    }

    #[tokio::test]
    async fn test_reselect_is_idempotent() {
        let (engine, _offset) = engine_with_offset(0.0);
        let mut server = mockito::Server::new_async().await;
        let payload = server
            .mock("GET", "/sub.vtt")
            .with_body("WEBVTT\n\n00:01.000 --> 00:02.000\nhi\n\n")
            .expect(1)
            .create_async()
            .await;

        engine
            .set_tracks(vec![SubtitleTrack {
                id: "sub-1".to_string(),
                label: "English".to_string(),
                language: Some("en".to_string()),
                url: Some(Url::parse(&format!("{}/sub.vtt", server.url())).unwrap()),
                origin: SubtitleOrigin::Addon,
                format: Some(CaptionFormat::Vtt),
                selected: false,
            }])
            .await;

        engine.select_track("sub-1").await.unwrap();
        // Reselecting the already-selected track issues nothing
        engine.select_track("sub-1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        payload.assert_async().await;
    }

    #[tokio::test]
    async fn test_aborted_fetch_injects_nothing() {
        use std::io::Write;

        let (engine, _offset) = engine_with_offset(0.0);
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/slow.srt")
            .with_chunked_body(|w| {
                w.write_all(b"1\n00:00:01,000 --> 00:00:02,000\nearly\n\n")?;
                std::thread::sleep(std::time::Duration::from_millis(150));
                w.write_all(b"2\n00:00:03,000 --> 00:00:04,000\nlate\n\n")
            })
            .create_async()
            .await;

        engine
            .set_tracks(vec![SubtitleTrack {
                id: "sub-slow".to_string(),
                label: "Slow".to_string(),
                language: Some("en".to_string()),
                url: Some(Url::parse(&format!("{}/slow.srt", server.url())).unwrap()),
                origin: SubtitleOrigin::Addon,
                format: Some(CaptionFormat::Srt),
                selected: false,
            }])
            .await;

        let mut cues_rx = engine.subscribe_cues();
        engine.select_track("sub-slow").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Turning captions off aborts the in-flight fetch; the late
        // chunk must not land
        engine.select_track("off").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        cues_rx.mark_unchanged();
        assert!(cues_rx.borrow().is_empty());
        assert!(engine.cues.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_delay_restamps_without_refetch() {
        let (engine, _offset) = engine_with_offset(0.0);
        let mut server = mockito::Server::new_async().await;
        let payload = server
            .mock("GET", "/sub.vtt")
            .with_body("WEBVTT\n\n00:10.000 --> 00:12.000\nhi\n\n")
            .expect(1)
            .create_async()
            .await;

        engine
            .set_tracks(vec![SubtitleTrack {
                id: "sub-1".to_string(),
                label: "English".to_string(),
                language: Some("en".to_string()),
                url: Some(Url::parse(&format!("{}/sub.vtt", server.url())).unwrap()),
                origin: SubtitleOrigin::Addon,
                format: Some(CaptionFormat::Vtt),
                selected: false,
            }])
            .await;

        engine.select_track("sub-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        engine.apply_delay(2.5).await;
        let rendered = engine.subscribe_cues().borrow().clone();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].start, 12.5);
        assert_eq!(rendered[0].end, 14.5);

        payload.assert_async().await;
    }

    #[tokio::test]
    async fn test_delay_persists_through_store() {
        let store = Arc::new(MemoryDelayStore::default());
        let (_, offset_rx) = watch::channel(0.0);
        let engine = SubtitleEngine::new(offset_rx.clone(), store.clone(), EngineConfig::default());
        engine.apply_delay(1.5).await;
        drop(engine);

        let engine = SubtitleEngine::new(offset_rx, store, EngineConfig::default());
        assert_eq!(engine.current_delay().await, 1.5);
    }

    #[tokio::test]
    async fn test_addon_discovery_series_id_shape() {
        let (engine, _offset) = engine_with_offset(0.0);
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/subtitles/series/tt0944947:3:9.json")
            .with_body(
                r#"{"subtitles": [
                    {"id": "os-1", "lang": "en", "url": "https://subs.example.com/a.srt"},
                    {"id": "os-2", "lang": "de", "url": "https://subs.example.com/b.vtt"}
                ]}"#,
            )
            .create_async()
            .await;

        let addons = vec![Url::parse(&format!("{}/", server.url())).unwrap()];
        let added = engine
            .discover_addon_tracks(&addons, "series", "tt0944947", Some(3), Some(9))
            .await;

        assert_eq!(added, 2);
        mock.assert_async().await;

        let tracks = engine.tracks().await;
        let os1 = tracks.iter().find(|t| t.id == "os-1").unwrap();
        assert_eq!(os1.origin, SubtitleOrigin::Addon);
        assert_eq!(os1.resolved_format(), CaptionFormat::Srt);
    }

    #[tokio::test]
    async fn test_addon_failure_is_skipped() {
        let (engine, _offset) = engine_with_offset(0.0);
        let mut broken = mockito::Server::new_async().await;
        broken
            .mock("GET", "/subtitles/movie/tt0111161.json")
            .with_status(500)
            .create_async()
            .await;
        let mut working = mockito::Server::new_async().await;
        working
            .mock("GET", "/subtitles/movie/tt0111161.json")
            .with_body(r#"{"subtitles": [{"id": "os-1", "lang": "en", "url": "https://subs.example.com/a.srt"}]}"#)
            .create_async()
            .await;

        let addons = vec![
            Url::parse(&format!("{}/", broken.url())).unwrap(),
            Url::parse(&format!("{}/", working.url())).unwrap(),
        ];
        let added = engine
            .discover_addon_tracks(&addons, "movie", "tt0111161", None, None)
            .await;
        assert_eq!(added, 1);
    }
}
