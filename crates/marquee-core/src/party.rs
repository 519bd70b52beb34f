//! Watch party membership and host-authoritative clock sync
//!
//! Symmetric data model, asymmetric authority: every participant holds
//! the same party row, but only the host writes `current_time_seconds`
//! and `is_playing`. Participants reconcile their local clock against
//! each broadcast, issuing at most one corrective seek per broadcast.
//!
//! Corrections are marked with one-shot ignore guards so the local
//! media events they trigger are not mistaken for user intent.

use crate::error::{Error, Result};
use crate::types::{EngineConfig, WatchParty, WatchPartyMember};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Playback surface the coordinator drives on the participant side
#[async_trait]
pub trait PlaybackControl: Send + Sync {
    /// Current global playback time
    fn current_time(&self) -> f64;

    async fn seek(&self, target_global: f64) -> Result<()>;

    async fn play(&self) -> Result<()>;

    fn pause(&self);

    fn is_paused(&self) -> bool;
}

/// Row-level change events on the party channel
#[derive(Debug, Clone)]
pub enum PartyEvent {
    Updated(WatchParty),
    Deleted { party_id: String },
    MembersChanged { party_id: String, count: usize },
}

impl PartyEvent {
    fn party_id(&self) -> &str {
        match self {
            PartyEvent::Updated(party) => &party.party_id,
            PartyEvent::Deleted { party_id } => party_id,
            PartyEvent::MembersChanged { party_id, .. } => party_id,
        }
    }
}

/// Notifications surfaced to the shell, distinct from errors
#[derive(Debug, Clone, PartialEq)]
pub enum PartyNotification {
    /// Membership count changed
    MemberCount(usize),
    /// The party is over: the host left or everyone else did.
    /// Terminal; the coordinator has already unsubscribed and stopped
    /// its heartbeat.
    Ended,
}

/// Storage and pub/sub backend for watch parties.
///
/// Production backends implement this against their database; tests and
/// single-process setups use [`MemoryPartyStore`].
#[async_trait]
pub trait PartyStore: Send + Sync {
    async fn insert_party(&self, party: WatchParty) -> Result<()>;

    async fn get_party(&self, party_id: &str) -> Result<Option<WatchParty>>;

    /// Overwrite the host-authoritative state fields
    async fn update_party_state(
        &self,
        party_id: &str,
        current_time_seconds: f64,
        is_playing: bool,
    ) -> Result<()>;

    /// Delete the party row and every membership row
    async fn delete_party(&self, party_id: &str) -> Result<()>;

    /// Idempotent membership insert
    async fn insert_member(&self, member: WatchPartyMember) -> Result<()>;

    async fn remove_member(&self, party_id: &str, user_id: &str) -> Result<()>;

    async fn member_count(&self, party_id: &str) -> Result<usize>;

    /// Refresh a member's liveness timestamp
    async fn touch_member(&self, party_id: &str, user_id: &str) -> Result<()>;

    /// Subscribe to events for all parties; callers filter by party id
    fn subscribe(&self) -> broadcast::Receiver<PartyEvent>;
}

/// In-memory `PartyStore` over a broadcast channel
pub struct MemoryPartyStore {
    parties: RwLock<HashMap<String, WatchParty>>,
    members: RwLock<HashMap<String, Vec<WatchPartyMember>>>,
    events: broadcast::Sender<PartyEvent>,
}

impl MemoryPartyStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            parties: RwLock::new(HashMap::new()),
            members: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn emit(&self, event: PartyEvent) {
        let _ = self.events.send(event);
    }

    /// Membership rows for a party (diagnostics and tests)
    pub async fn members_of(&self, party_id: &str) -> Vec<WatchPartyMember> {
        self.members
            .read()
            .await
            .get(party_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MemoryPartyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PartyStore for MemoryPartyStore {
    async fn insert_party(&self, party: WatchParty) -> Result<()> {
        self.parties
            .write()
            .await
            .insert(party.party_id.clone(), party.clone());
        self.emit(PartyEvent::Updated(party));
        Ok(())
    }

    async fn get_party(&self, party_id: &str) -> Result<Option<WatchParty>> {
        Ok(self.parties.read().await.get(party_id).cloned())
    }

    async fn update_party_state(
        &self,
        party_id: &str,
        current_time_seconds: f64,
        is_playing: bool,
    ) -> Result<()> {
        let mut parties = self.parties.write().await;
        let party = parties.get_mut(party_id).ok_or(Error::PartyNotFound)?;
        party.current_time_seconds = current_time_seconds;
        party.is_playing = is_playing;
        party.last_update = Utc::now();
        let snapshot = party.clone();
        drop(parties);
        self.emit(PartyEvent::Updated(snapshot));
        Ok(())
    }

    async fn delete_party(&self, party_id: &str) -> Result<()> {
        self.parties.write().await.remove(party_id);
        self.members.write().await.remove(party_id);
        self.emit(PartyEvent::Deleted {
            party_id: party_id.to_string(),
        });
        Ok(())
    }

    async fn insert_member(&self, member: WatchPartyMember) -> Result<()> {
        let mut members = self.members.write().await;
        let list = members.entry(member.party_id.clone()).or_default();
        if !list.iter().any(|m| m.user_id == member.user_id) {
            list.push(member.clone());
        }
        let count = list.len();
        drop(members);
        self.emit(PartyEvent::MembersChanged {
            party_id: member.party_id,
            count,
        });
        Ok(())
    }

    async fn remove_member(&self, party_id: &str, user_id: &str) -> Result<()> {
        let mut members = self.members.write().await;
        let count = match members.get_mut(party_id) {
            Some(list) => {
                list.retain(|m| m.user_id != user_id);
                list.len()
            }
            None => 0,
        };
        drop(members);
        self.emit(PartyEvent::MembersChanged {
            party_id: party_id.to_string(),
            count,
        });
        Ok(())
    }

    async fn member_count(&self, party_id: &str) -> Result<usize> {
        Ok(self
            .members
            .read()
            .await
            .get(party_id)
            .map(|l| l.len())
            .unwrap_or(0))
    }

    async fn touch_member(&self, party_id: &str, user_id: &str) -> Result<()> {
        let mut members = self.members.write().await;
        if let Some(member) = members
            .get_mut(party_id)
            .and_then(|l| l.iter_mut().find(|m| m.user_id == user_id))
        {
            member.last_seen = Utc::now();
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PartyEvent> {
        self.events.subscribe()
    }
}

/// Coordinates one user's participation in at most one watch party
pub struct WatchPartyCoordinator {
    store: Arc<dyn PartyStore>,
    control: Arc<dyn PlaybackControl>,
    config: EngineConfig,
    user_id: String,
    party: Arc<RwLock<Option<WatchParty>>>,
    /// Shared with the listener task so termination stops the heartbeat
    heartbeat_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    listen_task: Mutex<Option<JoinHandle<()>>>,
    /// One-shot guards consumed by the local event a correction triggers
    ignore_seek: Arc<AtomicBool>,
    ignore_play: Arc<AtomicBool>,
    notify_tx: broadcast::Sender<PartyNotification>,
}

impl WatchPartyCoordinator {
    pub fn new(
        store: Arc<dyn PartyStore>,
        control: Arc<dyn PlaybackControl>,
        user_id: String,
        config: EngineConfig,
    ) -> Self {
        let (notify_tx, _) = broadcast::channel(16);
        Self {
            store,
            control,
            config,
            user_id,
            party: Arc::new(RwLock::new(None)),
            heartbeat_task: Arc::new(Mutex::new(None)),
            listen_task: Mutex::new(None),
            ignore_seek: Arc::new(AtomicBool::new(false)),
            ignore_play: Arc::new(AtomicBool::new(false)),
            notify_tx,
        }
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<PartyNotification> {
        self.notify_tx.subscribe()
    }

    pub async fn current_party(&self) -> Option<WatchParty> {
        self.party.read().await.clone()
    }

    pub async fn is_host(&self) -> bool {
        self.party
            .read()
            .await
            .as_ref()
            .map(|p| p.host_id == self.user_id)
            .unwrap_or(false)
    }

    /// Create a party with the caller as host and start syncing
    #[instrument(skip(self, stream_source))]
    pub async fn create(
        &self,
        imdb_id: &str,
        stream_source: &str,
        season: Option<u32>,
        episode: Option<u32>,
        file_idx: Option<u32>,
    ) -> Result<String> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.party_ttl)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let party = WatchParty {
            party_id: Uuid::new_v4().simple().to_string(),
            host_id: self.user_id.clone(),
            imdb_id: imdb_id.to_string(),
            season,
            episode,
            stream_source: stream_source.to_string(),
            file_idx,
            current_time_seconds: self.control.current_time(),
            is_playing: !self.control.is_paused(),
            created_at: now,
            last_update: now,
            expires_at: now + ttl,
        };
        let party_id = party.party_id.clone();

        self.store.insert_party(party.clone()).await?;
        self.store
            .insert_member(WatchPartyMember {
                party_id: party_id.clone(),
                user_id: self.user_id.clone(),
                joined_at: now,
                last_seen: now,
            })
            .await?;

        *self.party.write().await = Some(party);
        self.start_listening(&party_id).await;
        self.start_heartbeat(&party_id).await;

        info!(%party_id, "Watch party created");
        Ok(party_id)
    }

    /// Join an existing party and reconcile to the host's state
    #[instrument(skip(self))]
    pub async fn join(&self, party_id: &str) -> Result<()> {
        let party = self
            .store
            .get_party(party_id)
            .await?
            .ok_or(Error::PartyNotFound)?;

        if party.is_expired(Utc::now()) {
            return Err(Error::PartyExpired);
        }

        let now = Utc::now();
        self.store
            .insert_member(WatchPartyMember {
                party_id: party_id.to_string(),
                user_id: self.user_id.clone(),
                joined_at: now,
                last_seen: now,
            })
            .await?;

        *self.party.write().await = Some(party.clone());
        self.start_listening(party_id).await;
        self.start_heartbeat(party_id).await;

        // Snap to the host's clock immediately rather than waiting for
        // the next broadcast
        reconcile(
            &party,
            self.control.as_ref(),
            &self.ignore_seek,
            &self.ignore_play,
            self.config.drift_threshold,
        )
        .await;

        info!(%party_id, "Joined watch party");
        Ok(())
    }

    /// Leave the current party. A host leave deletes the party and all
    /// memberships. Sync always stops, even when the store calls fail.
    #[instrument(skip(self))]
    pub async fn leave(&self) -> Result<()> {
        let party = self.party.write().await.take();
        let result = match &party {
            Some(party) if party.host_id == self.user_id => {
                self.store.delete_party(&party.party_id).await
            }
            Some(party) => {
                self.store
                    .remove_member(&party.party_id, &self.user_id)
                    .await
            }
            None => Ok(()),
        };

        self.stop_tasks().await;
        if let Some(party) = party {
            info!(party_id = %party.party_id, "Left watch party");
        }
        result
    }

    /// Publish the host's playback state. No-op for non-hosts.
    pub async fn publish_state(&self, current_time_seconds: f64, is_playing: bool) -> Result<()> {
        let party_id = {
            let party = self.party.read().await;
            match party.as_ref() {
                Some(p) if p.host_id == self.user_id => p.party_id.clone(),
                _ => return Ok(()),
            }
        };
        self.store
            .update_party_state(&party_id, current_time_seconds, is_playing)
            .await
    }

    /// Shell hook for a local seek event. Consumes the one-shot guard if
    /// the seek was a correction; otherwise a host publishes it.
    pub async fn report_local_seek(&self, current_time_seconds: f64) -> Result<()> {
        if self.ignore_seek.swap(false, Ordering::SeqCst) {
            debug!("Suppressed self-triggered seek event");
            return Ok(());
        }
        let is_playing = !self.control.is_paused();
        self.publish_state(current_time_seconds, is_playing).await
    }

    /// Shell hook for a local play/pause event, mirror of
    /// [`report_local_seek`]
    pub async fn report_local_play(&self, is_playing: bool) -> Result<()> {
        if self.ignore_play.swap(false, Ordering::SeqCst) {
            debug!("Suppressed self-triggered play/pause event");
            return Ok(());
        }
        self.publish_state(self.control.current_time(), is_playing)
            .await
    }

    async fn start_listening(&self, party_id: &str) {
        let mut events = self.store.subscribe();
        let party_id = party_id.to_string();
        let user_id = self.user_id.clone();
        let party = self.party.clone();
        let control = self.control.clone();
        let ignore_seek = self.ignore_seek.clone();
        let ignore_play = self.ignore_play.clone();
        let notify_tx = self.notify_tx.clone();
        let heartbeat_task = self.heartbeat_task.clone();
        let drift_threshold = self.config.drift_threshold;

        let handle = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Party event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if event.party_id() != party_id {
                    continue;
                }

                let is_host = party
                    .read()
                    .await
                    .as_ref()
                    .map(|p| p.host_id == user_id)
                    .unwrap_or(false);

                match event {
                    PartyEvent::Updated(remote) => {
                        *party.write().await = Some(remote.clone());
                        if !is_host {
                            reconcile(
                                &remote,
                                control.as_ref(),
                                &ignore_seek,
                                &ignore_play,
                                drift_threshold,
                            )
                            .await;
                        }
                    }
                    PartyEvent::Deleted { .. } => {
                        if !is_host {
                            party.write().await.take();
                            if let Some(task) = heartbeat_task.lock().await.take() {
                                task.abort();
                            }
                            let _ = notify_tx.send(PartyNotification::Ended);
                            break;
                        }
                    }
                    PartyEvent::MembersChanged { count, .. } => {
                        let _ = notify_tx.send(PartyNotification::MemberCount(count));
                        if count == 0 && !is_host {
                            party.write().await.take();
                            if let Some(task) = heartbeat_task.lock().await.take() {
                                task.abort();
                            }
                            let _ = notify_tx.send(PartyNotification::Ended);
                            break;
                        }
                    }
                }
            }
        });

        let mut task = self.listen_task.lock().await;
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    async fn start_heartbeat(&self, party_id: &str) {
        let store = self.store.clone();
        let party_id = party_id.to_string();
        let user_id = self.user_id.clone();
        let interval = self.config.heartbeat_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = store.touch_member(&party_id, &user_id).await {
                    // Liveness only; never fatal
                    warn!(error = %err, "Heartbeat failed");
                }
            }
        });

        let mut task = self.heartbeat_task.lock().await;
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    async fn stop_tasks(&self) {
        if let Some(task) = self.listen_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.heartbeat_task.lock().await.take() {
            task.abort();
        }
    }

    /// Stop syncing without mutating the store
    pub async fn teardown(&self) {
        self.stop_tasks().await;
        self.party.write().await.take();
    }
}

/// Reconcile local playback against a host broadcast: at most one
/// corrective seek per broadcast, play/pause always aligned. Failures
/// are logged and skipped for the cycle.
async fn reconcile(
    remote: &WatchParty,
    control: &dyn PlaybackControl,
    ignore_seek: &AtomicBool,
    ignore_play: &AtomicBool,
    drift_threshold: f64,
) {
    let drift = (control.current_time() - remote.current_time_seconds).abs();
    if drift > drift_threshold {
        debug!(drift, target = remote.current_time_seconds, "Correcting drift");
        ignore_seek.store(true, Ordering::SeqCst);
        if let Err(err) = control.seek(remote.current_time_seconds).await {
            ignore_seek.store(false, Ordering::SeqCst);
            warn!(error = %err, "Corrective seek failed");
        }
    }

    let locally_playing = !control.is_paused();
    if locally_playing != remote.is_playing {
        ignore_play.store(true, Ordering::SeqCst);
        if remote.is_playing {
            if let Err(err) = control.play().await {
                ignore_play.store(false, Ordering::SeqCst);
                warn!(error = %err, "Corrective play failed");
            }
        } else {
            control.pause();
        }
    }
}
