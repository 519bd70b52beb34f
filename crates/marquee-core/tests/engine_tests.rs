//! End-to-end playback flows against a mocked transcoder

use async_trait::async_trait;
use marquee_core::{
    EngineConfig, ManifestSlice, ManifestState, MediaSurface, MemoryDelayStore, MemoryPartyStore,
    PartyStore, PlayerEngine, Result, SeekOutcome, WatchPartyCoordinator,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

#[derive(Default)]
struct FakeSurface {
    ranges: Mutex<Vec<(f64, f64)>>,
    time: Mutex<f64>,
    paused: Mutex<bool>,
    attach_count: AtomicUsize,
}

#[async_trait]
impl MediaSurface for FakeSurface {
    fn buffered_ranges(&self) -> Vec<(f64, f64)> {
        self.ranges.lock().unwrap().clone()
    }

    fn current_time(&self) -> f64 {
        *self.time.lock().unwrap()
    }

    fn set_current_time(&self, local: f64) {
        *self.time.lock().unwrap() = local;
    }

    async fn play(&self) -> Result<()> {
        *self.paused.lock().unwrap() = false;
        Ok(())
    }

    fn pause(&self) {
        *self.paused.lock().unwrap() = true;
    }

    fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap()
    }

    async fn attach(&self, _slice: &ManifestSlice) -> Result<()> {
        self.attach_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset_decoder(&self) -> Result<()> {
        Ok(())
    }

    fn detach(&self) {}
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        network_retry_delay: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

fn engine_for(server: &mockito::ServerGuard, surface: Arc<FakeSurface>) -> PlayerEngine {
    PlayerEngine::new(
        Url::parse(&server.url()).unwrap(),
        surface,
        Arc::new(MemoryDelayStore::default()),
        fast_config(),
    )
}

/// Mocks for a complete session bring-up: create, probe, manifest
async fn mock_session(server: &mut mockito::ServerGuard) {
    server
        .mock("POST", "/sessions")
        .with_body(r#"{"id":"sess-9"}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/sessions/sess-9")
        .with_body(
            r#"{
                "durationSeconds": 5400.0,
                "audioIndex": 1,
                "availableStreams": [
                    {"index": 0, "type": "audio", "title": "English", "language": "en"},
                    {"index": 1, "type": "audio", "title": "Japanese", "language": "ja"},
                    {"index": 3, "type": "subtitle", "title": "Japanese", "language": "ja"},
                    {"index": 4, "type": "subtitle", "language": "en"}
                ],
                "chapters": [
                    {"title": "Opening", "startSeconds": 0.0, "endSeconds": 90.0}
                ]
            }"#,
        )
        .create_async()
        .await;
    server
        .mock("GET", "/sessions/sess-9/stream/child.m3u8")
        .with_body("#EXTM3U\n")
        .create_async()
        .await;
}

#[tokio::test]
async fn test_load_brings_up_session_and_auto_selects_captions() {
    let mut server = mockito::Server::new_async().await;
    mock_session(&mut server).await;
    // The active audio is Japanese, so the ja subtitle wins auto-select
    let payload = server
        .mock("GET", "/sessions/sess-9/subtitles/3.vtt")
        .match_query(mockito::Matcher::UrlEncoded("startTime".into(), "0".into()))
        .with_body("WEBVTT\n\n00:05.000 --> 00:07.000\nkonnichiwa\n\n")
        .expect(1)
        .create_async()
        .await;

    let surface = Arc::new(FakeSurface::default());
    let engine = engine_for(&server, surface.clone());

    let session = engine
        .load("https://example.com/show.mkv", 0.0, None)
        .await
        .unwrap();
    assert_eq!(session.id, "sess-9");
    assert_eq!(session.duration_seconds, 5400.0);
    assert_eq!(engine.chapters().await.len(), 1);
    assert_eq!(surface.attach_count.load(Ordering::SeqCst), 1);

    let controller = engine.manifest().await.unwrap();
    assert_eq!(controller.state().await, ManifestState::Ready);

    let subtitles = engine.subtitles().await.unwrap();
    assert_eq!(subtitles.selected_track().await.unwrap().id, "embedded-3");

    // Cues land shortly after selection
    let mut cues_rx = subtitles.subscribe_cues();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !cues_rx.borrow_and_update().is_empty() {
                break;
            }
            cues_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("no cues arrived");

    payload.assert_async().await;
}

#[tokio::test]
async fn test_explicit_subtitle_choice_survives_load_flow() {
    let mut server = mockito::Server::new_async().await;
    mock_session(&mut server).await;
    server
        .mock("GET", mockito::Matcher::Regex(r"^/sessions/sess-9/subtitles/".into()))
        .with_body("WEBVTT\n\n00:05.000 --> 00:07.000\nhello\n\n")
        .create_async()
        .await;

    let engine = engine_for(&server, Arc::new(FakeSurface::default()));
    engine
        .load("https://example.com/show.mkv", 0.0, None)
        .await
        .unwrap();

    engine.select_subtitle_track("embedded-4").await.unwrap();
    let subtitles = engine.subtitles().await.unwrap();
    assert_eq!(subtitles.selected_track().await.unwrap().id, "embedded-4");

    // A later auto-select pass never overrides the explicit choice
    subtitles.auto_select(Some("ja")).await.unwrap();
    assert_eq!(subtitles.selected_track().await.unwrap().id, "embedded-4");
}

#[tokio::test]
async fn test_hard_seek_refetches_captions_at_new_offset() {
    let mut server = mockito::Server::new_async().await;
    mock_session(&mut server).await;
    server
        .mock("GET", "/sessions/sess-9/subtitles/3.vtt")
        .match_query(mockito::Matcher::UrlEncoded("startTime".into(), "0".into()))
        .with_body("WEBVTT\n\n00:05.000 --> 00:07.000\nearly\n\n")
        .create_async()
        .await;
    server
        .mock("GET", "/sessions/sess-9/stream/child.m3u8")
        .match_query(mockito::Matcher::AllOf(vec![
            mockito::Matcher::UrlEncoded("seek".into(), "900".into()),
            mockito::Matcher::UrlEncoded("force_slice".into(), "1".into()),
        ]))
        .with_header("X-Raffi-Slice-Start", "880")
        .with_body("#EXTM3U\n")
        .create_async()
        .await;
    let resliced_payload = server
        .mock("GET", "/sessions/sess-9/subtitles/3.vtt")
        .match_query(mockito::Matcher::UrlEncoded(
            "startTime".into(),
            "880".into(),
        ))
        .with_body("WEBVTT\n\n00:25.000 --> 00:27.000\nlater\n\n")
        .expect(1)
        .create_async()
        .await;

    let surface = Arc::new(FakeSurface::default());
    let engine = engine_for(&server, surface.clone());
    engine
        .load("https://example.com/show.mkv", 0.0, None)
        .await
        .unwrap();

    let outcome = engine.seek(900.0).await.unwrap();
    assert_eq!(outcome, SeekOutcome::Hard { offset: 880.0 });
    assert_eq!(engine.global_time().await, 880.0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    resliced_payload.assert_async().await;
}

#[tokio::test]
async fn test_teardown_fires_cleanup_beacon() {
    let mut server = mockito::Server::new_async().await;
    mock_session(&mut server).await;
    server
        .mock("GET", mockito::Matcher::Regex(r"^/sessions/sess-9/subtitles/".into()))
        .with_body("WEBVTT\n")
        .create_async()
        .await;
    let cleanup = server
        .mock("POST", "/cleanup")
        .match_query(mockito::Matcher::UrlEncoded("id".into(), "sess-9".into()))
        .expect(1)
        .create_async()
        .await;

    let engine = engine_for(&server, Arc::new(FakeSurface::default()));
    engine
        .load("https://example.com/show.mkv", 0.0, None)
        .await
        .unwrap();

    engine.teardown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    cleanup.assert_async().await;
    assert!(engine.manifest().await.is_none());
    assert!(engine.session().await.is_none());
}

#[tokio::test]
async fn test_party_broadcast_corrects_engine_clock() {
    let mut server = mockito::Server::new_async().await;
    mock_session(&mut server).await;
    server
        .mock("GET", mockito::Matcher::Regex(r"^/sessions/sess-9/subtitles/".into()))
        .with_body("WEBVTT\n")
        .create_async()
        .await;
    server
        .mock("GET", "/sessions/sess-9/stream/child.m3u8")
        .match_query(mockito::Matcher::UrlEncoded("seek".into(), "500".into()))
        .with_header("X-Raffi-Slice-Start", "495")
        .with_body("#EXTM3U\n")
        .create_async()
        .await;

    let surface = Arc::new(FakeSurface::default());
    let engine = engine_for(&server, surface.clone());
    engine
        .load("https://example.com/show.mkv", 0.0, None)
        .await
        .unwrap();

    // A host elsewhere runs the party; this engine joins as a guest
    let store = Arc::new(MemoryPartyStore::new());
    let host = WatchPartyCoordinator::new(
        store.clone() as Arc<dyn PartyStore>,
        Arc::new(HostClock(500.0)),
        "host".to_string(),
        fast_config(),
    );
    let party_id = host
        .create("tt0903747", "https://example.com/show.mkv", None, None, None)
        .await
        .unwrap();

    let guest = engine.watch_party(store, "guest".to_string()).await.unwrap();
    guest.join(&party_id).await.unwrap();

    // Joining snapped the guest to the host clock via a hard seek
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.global_time().await, 495.0);
}

struct HostClock(f64);

#[async_trait]
impl marquee_core::PlaybackControl for HostClock {
    fn current_time(&self) -> f64 {
        self.0
    }

    async fn seek(&self, _target_global: f64) -> Result<()> {
        Ok(())
    }

    async fn play(&self) -> Result<()> {
        Ok(())
    }

    fn pause(&self) {}

    fn is_paused(&self) -> bool {
        true
    }
}
