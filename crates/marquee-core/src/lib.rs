//! Marquee Core - Playback Session Engine for Marquee
//!
//! This crate provides the core functionality for video playback:
//! - Session negotiation against a remote transcoder
//! - Adaptive-streaming manifest lifecycle with soft/hard seeking
//! - Incremental subtitle fetch, parse, and time-shifted rendering
//! - Host-authoritative watch party synchronization
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Marquee Core                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Session    │  │   Manifest   │  │   Subtitle   │           │
//! │  │   Manager    │  │  Controller  │  │    Engine    │           │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘           │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │                    ┌──────┴──────┐                              │
//! │                    │   Player    │                              │
//! │                    │   Engine    │                              │
//! │                    └──────┬──────┘                              │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────┴──────┐                              │
//! │  │  Transcoder  │  │ Watch Party │                              │
//! │  │    Client    │  │ Coordinator │                              │
//! │  └──────────────┘  └─────────────┘                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod transcoder;
pub mod session;
pub mod manifest;
pub mod subtitles;
pub mod party;
pub mod engine;

pub use error::{Error, Result};
pub use types::*;
pub use transcoder::{ClipRequest, ClipResponse, ManifestSlice, TranscoderClient};
pub use session::SessionManager;
pub use manifest::{is_time_buffered, ManifestController, MediaSurface};
pub use subtitles::{DelayStore, MemoryDelayStore, SubtitleEngine};
pub use party::{
    MemoryPartyStore, PartyEvent, PartyNotification, PartyStore, PlaybackControl,
    WatchPartyCoordinator,
};
pub use engine::PlayerEngine;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
