//! Reactive room store
//!
//! Every sub-state is an [`Observable`], a value behind a
//! [`tokio::sync::watch`] channel. A mutation is one closure applied to the
//! current snapshot, so observers never see a half-applied update. Sub-states
//! publish independently of each other.
//!
//! Operations addressing an id the store does not know are no-ops and do not
//! publish; they return `false`.

use crate::model::{
    Consumers, ConsumerState, DataConsumerState, DataConsumers, Me, Originator, Peers,
    ProducerState, Producers, RemotePeer, RoomInfo,
};
use crate::types::{ConnectionState, DeviceInfo, Notify, PeerInfo};
use serde_json::Value;
use tokio::sync::{broadcast, watch};

/// Capacity of the notify fan-out; slow receivers lag past this
pub const NOTIFY_CAPACITY: usize = 64;

/// A value whose changes can be observed
#[derive(Debug)]
pub struct Observable<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> Observable<T> {
    /// Wrap an initial value
    pub fn new(value: T) -> Self {
        let (tx, _) = watch::channel(value);
        Self { tx }
    }

    /// Snapshot of the current value
    #[must_use]
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Read the current value in place
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Receiver notified on every published change
    #[must_use]
    pub fn observe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Apply `f` and publish
    pub fn mutate(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    /// Apply `f` and publish only if it returns `true`
    ///
    /// `f` must leave the value untouched when returning `false`.
    pub fn mutate_if(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }
}

impl<T: Clone + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Shared room state, written by the session and read by anyone
#[derive(Debug)]
pub struct RoomStore {
    /// Room level state
    pub room_info: Observable<RoomInfo>,
    /// Local participant
    pub me: Observable<Me>,
    /// Remote peers
    pub peers: Observable<Peers>,
    /// Local producers
    pub producers: Observable<Producers>,
    /// Consumers
    pub consumers: Observable<Consumers>,
    /// Data consumers
    pub data_consumers: Observable<DataConsumers>,
    notify: broadcast::Sender<Notify>,
}

impl Default for RoomStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomStore {
    /// Empty store in state `New`
    #[must_use]
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            room_info: Observable::default(),
            me: Observable::default(),
            peers: Observable::default(),
            producers: Observable::default(),
            consumers: Observable::default(),
            data_consumers: Observable::default(),
            notify,
        }
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.room_info.with(|info| info.state)
    }

    // Room

    /// Record where the room lives
    pub fn set_room_url(&self, room_id: &str, peer_id: &str, url: &str) {
        self.room_info.mutate(|info| {
            info.room_id = room_id.to_string();
            info.peer_id = peer_id.to_string();
            info.url = url.to_string();
        });
    }

    /// Move the connection state; invalid or repeated transitions are ignored
    ///
    /// Entering `Closed` also clears everything belonging to the session.
    pub fn set_room_state(&self, state: ConnectionState) -> bool {
        let changed = self.room_info.mutate_if(|info| {
            if info.state == state {
                return false;
            }
            if !info.state.can_transition_to(state) {
                tracing::warn!(from = %info.state, to = %state, "ignoring invalid state transition");
                return false;
            }
            info.state = state;
            if state == ConnectionState::Closed {
                info.active_speaker_id = None;
            }
            true
        });

        if changed {
            tracing::info!(state = %state, "room state changed");
            if state == ConnectionState::Closed {
                self.clear_session();
                self.me.mutate(Me::clear_transient);
            }
        }
        changed
    }

    /// Drop peers, producers and consumers of the current session
    pub fn reset_session(&self) {
        self.room_info.mutate_if(|info| info.active_speaker_id.take().is_some());
        self.clear_session();
    }

    fn clear_session(&self) {
        self.peers.mutate_if(|peers| clear_map(peers));
        self.producers.mutate_if(|producers| clear_map(producers));
        self.consumers.mutate_if(|consumers| clear_map(consumers));
        self.data_consumers.mutate_if(|data| clear_map(data));
    }

    /// Set or clear the active speaker
    pub fn set_room_active_speaker(&self, peer_id: Option<String>) -> bool {
        self.room_info.mutate_if(|info| {
            if info.active_speaker_id == peer_id {
                return false;
            }
            info.active_speaker_id = peer_id;
            true
        })
    }

    // Me

    /// Identity of the local participant
    pub fn set_me(&self, peer_id: &str, display_name: &str, device: DeviceInfo) {
        self.me.mutate(|me| {
            me.id = peer_id.to_string();
            me.display_name = display_name.to_string();
            me.device = device;
        });
    }

    /// What the loaded device can send
    pub fn set_media_capabilities(&self, can_send_mic: bool, can_send_cam: bool) {
        self.me.mutate(|me| {
            me.can_send_mic = can_send_mic;
            me.can_send_cam = can_send_cam;
        });
    }

    /// Whether the camera can be switched
    pub fn set_can_change_cam(&self, can_change_cam: bool) {
        self.me.mutate(|me| me.can_change_cam = can_change_cam);
    }

    /// Local display name
    pub fn set_display_name(&self, display_name: &str) {
        self.me.mutate(|me| me.display_name = display_name.to_string());
    }

    /// Audio-only mode
    pub fn set_audio_only_state(&self, enabled: bool) {
        self.me.mutate(|me| me.audio_only = enabled);
    }

    /// Audio-only toggle in flight
    pub fn set_audio_only_in_progress(&self, in_progress: bool) {
        self.me.mutate(|me| me.audio_only_in_progress = in_progress);
    }

    /// Local playback mute
    pub fn set_audio_muted_state(&self, muted: bool) {
        self.me.mutate(|me| me.audio_muted = muted);
    }

    /// ICE restart in flight
    pub fn set_restart_ice_in_progress(&self, in_progress: bool) {
        self.me.mutate(|me| me.restart_ice_in_progress = in_progress);
    }

    /// Camera operation in flight
    pub fn set_cam_in_progress(&self, in_progress: bool) {
        self.me.mutate(|me| me.cam_in_progress = in_progress);
    }

    // Producers

    /// Register a local producer
    pub fn add_producer(&self, producer: ProducerState) {
        self.producers.mutate(|producers| {
            producers.insert(producer.id.clone(), producer);
        });
    }

    /// Remove a local producer
    pub fn remove_producer(&self, producer_id: &str) -> bool {
        self.producers
            .mutate_if(|producers| producers.shift_remove(producer_id).is_some())
    }

    /// Mark a producer paused
    pub fn set_producer_paused(&self, producer_id: &str) -> bool {
        self.update_producer(producer_id, |p| p.paused = true)
    }

    /// Mark a producer resumed
    pub fn set_producer_resumed(&self, producer_id: &str) -> bool {
        self.update_producer(producer_id, |p| p.paused = false)
    }

    /// Server score of a producer
    pub fn set_producer_score(&self, producer_id: &str, score: Value) -> bool {
        self.update_producer(producer_id, |p| p.score = Some(score))
    }

    fn update_producer(&self, producer_id: &str, f: impl FnOnce(&mut ProducerState)) -> bool {
        self.producers.mutate_if(|producers| match producers.get_mut(producer_id) {
            Some(producer) => {
                f(producer);
                true
            }
            None => {
                tracing::debug!(producer_id, "unknown producer");
                false
            }
        })
    }

    // Peers

    /// Register a remote peer
    ///
    /// A peer announced again keeps its consumer links; only its name and
    /// device are refreshed.
    pub fn add_peer(&self, info: PeerInfo) {
        self.peers.mutate(|peers| match peers.get_mut(&info.id) {
            Some(peer) => {
                tracing::debug!(peer_id = %info.id, "peer announced again");
                peer.display_name = info.display_name;
                peer.device = info.device;
            }
            None => {
                peers.insert(info.id.clone(), RemotePeer::from(info));
            }
        });
    }

    /// Rename a remote peer
    pub fn set_peer_display_name(&self, peer_id: &str, display_name: &str) -> bool {
        self.peers.mutate_if(|peers| match peers.get_mut(peer_id) {
            Some(peer) => {
                peer.display_name = display_name.to_string();
                true
            }
            None => {
                tracing::debug!(peer_id, "unknown peer");
                false
            }
        })
    }

    /// Remove a remote peer with its consumers and data consumers
    ///
    /// Consumers owned by `peer_id` go even when the peer itself was never
    /// seen. Clears the active speaker if it was this peer.
    pub fn remove_peer(&self, peer_id: &str) -> Option<RemotePeer> {
        let mut removed = None;
        self.peers.mutate_if(|peers| {
            removed = peers.shift_remove(peer_id);
            removed.is_some()
        });

        self.consumers
            .mutate_if(|consumers| retain_changed(consumers, |c| c.peer_id != peer_id));
        self.data_consumers.mutate_if(|data| {
            retain_changed(data, |d| d.peer_id.as_deref() != Some(peer_id))
        });
        self.room_info.mutate_if(|info| {
            if info.active_speaker_id.as_deref() == Some(peer_id) {
                info.active_speaker_id = None;
                true
            } else {
                false
            }
        });
        removed
    }

    // Consumers

    /// Register a consumer under its owning peer
    pub fn add_consumer(&self, consumer: ConsumerState) {
        let peer_id = consumer.peer_id.clone();
        let consumer_id = consumer.id.clone();
        self.peers.mutate_if(|peers| match peers.get_mut(&peer_id) {
            Some(peer) => peer.consumers.insert(consumer_id.clone()),
            None => {
                tracing::warn!(peer_id = %peer_id, consumer_id = %consumer_id, "consumer for unknown peer");
                false
            }
        });
        self.consumers.mutate(|consumers| {
            consumers.insert(consumer_id, consumer);
        });
    }

    /// Remove a consumer and its link from the owning peer
    pub fn remove_consumer(&self, consumer_id: &str) -> bool {
        let mut removed = None;
        self.consumers.mutate_if(|consumers| {
            removed = consumers.shift_remove(consumer_id);
            removed.is_some()
        });
        let Some(consumer) = removed else {
            return false;
        };
        self.peers.mutate_if(|peers| {
            peers
                .get_mut(&consumer.peer_id)
                .is_some_and(|peer| peer.consumers.shift_remove(consumer_id))
        });
        true
    }

    /// Mark a consumer paused by `originator`
    pub fn set_consumer_paused(&self, consumer_id: &str, originator: Originator) -> bool {
        self.update_consumer(consumer_id, |c| match originator {
            Originator::Local => c.locally_paused = true,
            Originator::Remote => c.remotely_paused = true,
        })
    }

    /// Mark a consumer resumed by `originator`
    pub fn set_consumer_resumed(&self, consumer_id: &str, originator: Originator) -> bool {
        self.update_consumer(consumer_id, |c| match originator {
            Originator::Local => c.locally_paused = false,
            Originator::Remote => c.remotely_paused = false,
        })
    }

    /// Layers currently forwarded to a consumer
    pub fn set_consumer_current_layers(
        &self,
        consumer_id: &str,
        spatial_layer: Option<u32>,
        temporal_layer: Option<u32>,
    ) -> bool {
        self.update_consumer(consumer_id, |c| {
            c.spatial_layer = spatial_layer;
            c.temporal_layer = temporal_layer;
        })
    }

    /// Layers asked for by the local user
    pub fn set_consumer_preferred_layers(
        &self,
        consumer_id: &str,
        spatial_layer: u32,
        temporal_layer: u32,
    ) -> bool {
        self.update_consumer(consumer_id, |c| {
            c.preferred_spatial_layer = Some(spatial_layer);
            c.preferred_temporal_layer = Some(temporal_layer);
        })
    }

    /// Server score of a consumer
    pub fn set_consumer_score(&self, consumer_id: &str, score: Value) -> bool {
        self.update_consumer(consumer_id, |c| c.score = Some(score))
    }

    fn update_consumer(&self, consumer_id: &str, f: impl FnOnce(&mut ConsumerState)) -> bool {
        self.consumers.mutate_if(|consumers| match consumers.get_mut(consumer_id) {
            Some(consumer) => {
                f(consumer);
                true
            }
            None => {
                tracing::debug!(consumer_id, "unknown consumer");
                false
            }
        })
    }

    // Data consumers

    /// Register a data consumer under its owning peer, if any
    pub fn add_data_consumer(&self, data_consumer: DataConsumerState) {
        if let Some(peer_id) = data_consumer.peer_id.clone() {
            let id = data_consumer.id.clone();
            self.peers.mutate_if(|peers| {
                peers
                    .get_mut(&peer_id)
                    .is_some_and(|peer| peer.data_consumers.insert(id))
            });
        }
        self.data_consumers.mutate(|data| {
            data.insert(data_consumer.id.clone(), data_consumer);
        });
    }

    /// Remove a data consumer and its link from the owning peer
    pub fn remove_data_consumer(&self, data_consumer_id: &str) -> bool {
        let mut removed = None;
        self.data_consumers.mutate_if(|data| {
            removed = data.shift_remove(data_consumer_id);
            removed.is_some()
        });
        let Some(data_consumer) = removed else {
            return false;
        };
        if let Some(peer_id) = data_consumer.peer_id {
            self.peers.mutate_if(|peers| {
                peers
                    .get_mut(&peer_id)
                    .is_some_and(|peer| peer.data_consumers.shift_remove(data_consumer_id))
            });
        }
        true
    }

    // Notify

    /// Publish a notify to current subscribers
    pub fn add_notify(&self, notify: Notify) {
        tracing::debug!(kind = ?notify.kind, text = %notify.text, "notify");
        let _ = self.notify.send(notify);
    }

    /// Subscribe to notifies published from now on
    #[must_use]
    pub fn subscribe_notify(&self) -> broadcast::Receiver<Notify> {
        self.notify.subscribe()
    }
}

fn clear_map<K, V>(map: &mut indexmap::IndexMap<K, V>) -> bool {
    if map.is_empty() {
        return false;
    }
    map.clear();
    true
}

fn retain_changed<K, V>(
    map: &mut indexmap::IndexMap<K, V>,
    mut keep: impl FnMut(&V) -> bool,
) -> bool {
    let before = map.len();
    map.retain(|_, v| keep(v));
    map.len() != before
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::MediaKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn peer(id: &str, name: &str) -> PeerInfo {
        PeerInfo {
            id: id.to_string(),
            display_name: name.to_string(),
            device: DeviceInfo::unknown(),
        }
    }

    fn consumer(id: &str, peer_id: &str, kind: MediaKind) -> ConsumerState {
        ConsumerState {
            id: id.to_string(),
            peer_id: peer_id.to_string(),
            producer_id: format!("{id}-producer"),
            kind,
            consumer_type: "simple".to_string(),
            locally_paused: false,
            remotely_paused: false,
            spatial_layer: None,
            temporal_layer: None,
            preferred_spatial_layer: None,
            preferred_temporal_layer: None,
            score: None,
            track_id: format!("{id}-track"),
        }
    }

    #[test]
    fn test_unknown_ids_do_not_publish() {
        let store = RoomStore::new();
        let mut consumers = store.consumers.observe();
        let mut producers = store.producers.observe();
        let mut peers = store.peers.observe();

        assert!(!store.set_consumer_score("nope", json!({"score": 10})));
        assert!(!store.set_consumer_paused("nope", Originator::Remote));
        assert!(!store.remove_consumer("nope"));
        assert!(!store.set_producer_score("nope", json!([])));
        assert!(!store.set_peer_display_name("nope", "x"));
        assert!(store.remove_peer("nope").is_none());

        assert!(!consumers.has_changed().unwrap());
        assert!(!producers.has_changed().unwrap());
        assert!(!peers.has_changed().unwrap());
    }

    #[test]
    fn test_peers_keep_insertion_order() {
        let store = RoomStore::new();
        for id in ["c", "a", "b"] {
            store.add_peer(peer(id, id));
        }
        store.remove_peer("a");
        store.add_peer(peer("d", "d"));
        let ids: Vec<_> = store.peers.get().keys().cloned().collect();
        assert_eq!(ids, vec!["c", "b", "d"]);
    }

    #[test]
    fn test_remove_peer_drops_its_consumers_and_active_speaker() {
        let store = RoomStore::new();
        store.add_peer(peer("p1", "Alice"));
        store.add_peer(peer("p2", "Bob"));
        store.add_consumer(consumer("c1", "p1", MediaKind::Audio));
        store.add_consumer(consumer("c2", "p2", MediaKind::Video));
        store.add_data_consumer(DataConsumerState {
            id: "d1".to_string(),
            peer_id: Some("p1".to_string()),
            data_producer_id: "dp1".to_string(),
            label: "chat".to_string(),
            protocol: "chat".to_string(),
        });
        store.set_room_active_speaker(Some("p1".to_string()));
        assert!(store.peers.get()["p1"].consumers.contains("c1"));

        let removed = store.remove_peer("p1").unwrap();
        assert_eq!(removed.display_name, "Alice");
        assert_eq!(store.consumers.get().keys().collect::<Vec<_>>(), vec!["c2"]);
        assert!(store.data_consumers.get().is_empty());
        assert_eq!(store.room_info.get().active_speaker_id, None);
    }

    #[test]
    fn test_remove_unseen_peer_drops_its_consumers() {
        let store = RoomStore::new();
        store.add_consumer(consumer("c1", "ghost", MediaKind::Audio));
        store.add_data_consumer(DataConsumerState {
            id: "d1".to_string(),
            peer_id: Some("ghost".to_string()),
            data_producer_id: "dp1".to_string(),
            label: "chat".to_string(),
            protocol: "chat".to_string(),
        });

        assert!(store.remove_peer("ghost").is_none());
        assert!(store.consumers.get().is_empty());
        assert!(store.data_consumers.get().is_empty());
    }

    #[test]
    fn test_peer_announced_twice_keeps_links() {
        let store = RoomStore::new();
        store.add_peer(peer("p1", "Alice"));
        store.add_consumer(consumer("c1", "p1", MediaKind::Audio));

        store.add_peer(peer("p1", "Alice 2"));
        let peers = store.peers.get();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers["p1"].display_name, "Alice 2");
        assert!(peers["p1"].consumers.contains("c1"));
    }

    #[test]
    fn test_consumer_pause_flags_are_independent() {
        let store = RoomStore::new();
        store.add_peer(peer("p1", "Alice"));
        store.add_consumer(consumer("c1", "p1", MediaKind::Video));

        store.set_consumer_paused("c1", Originator::Local);
        store.set_consumer_paused("c1", Originator::Remote);
        store.set_consumer_resumed("c1", Originator::Remote);
        let c = store.consumers.get()["c1"].clone();
        assert!(c.locally_paused);
        assert!(!c.remotely_paused);

        store.set_consumer_current_layers("c1", Some(2), None);
        store.set_consumer_preferred_layers("c1", 1, 1);
        let c = store.consumers.get()["c1"].clone();
        assert_eq!((c.spatial_layer, c.temporal_layer), (Some(2), None));
        assert_eq!(c.preferred_spatial_layer, Some(1));

        assert!(store.remove_consumer("c1"));
        assert!(store.peers.get()["p1"].consumers.is_empty());
    }

    #[test]
    fn test_state_transitions_and_close_clears_session() {
        let store = RoomStore::new();
        store.set_me("me", "Alice", DeviceInfo::unknown());
        assert!(store.set_room_state(ConnectionState::Connecting));
        assert!(!store.set_room_state(ConnectionState::Connecting));
        assert!(store.set_room_state(ConnectionState::Connected));

        store.add_peer(peer("p1", "Bob"));
        store.add_producer(ProducerState {
            id: "mic".to_string(),
            kind: MediaKind::Audio,
            paused: false,
            track_id: "t".to_string(),
            score: None,
        });
        store.set_audio_only_state(true);

        let mut room = store.room_info.observe();
        room.borrow_and_update();
        assert!(store.set_room_state(ConnectionState::Closed));
        assert!(room.has_changed().unwrap());

        assert_eq!(store.state(), ConnectionState::Closed);
        assert!(store.peers.get().is_empty());
        assert!(store.producers.get().is_empty());
        assert!(!store.me.get().audio_only);
        assert_eq!(store.me.get().display_name, "Alice");

        room.borrow_and_update();
        assert!(!store.set_room_state(ConnectionState::Closed));
        assert!(!store.set_room_state(ConnectionState::Connecting));
        assert!(!room.has_changed().unwrap());
    }

    #[test]
    fn test_reset_session_keeps_state() {
        let store = RoomStore::new();
        store.set_room_state(ConnectionState::Connecting);
        store.set_room_state(ConnectionState::Connected);
        store.add_peer(peer("p1", "Bob"));
        store.set_room_active_speaker(Some("p1".to_string()));

        store.reset_session();
        assert!(store.peers.get().is_empty());
        assert_eq!(store.room_info.get().active_speaker_id, None);
        assert_eq!(store.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_observers_see_whole_updates() {
        let store = std::sync::Arc::new(RoomStore::new());
        let mut me = store.me.observe();

        let writer = store.clone();
        tokio::spawn(async move {
            writer.set_media_capabilities(true, true);
        });

        me.changed().await.unwrap();
        let snapshot = me.borrow_and_update().clone();
        assert!(snapshot.can_send_mic && snapshot.can_send_cam);
    }

    #[tokio::test]
    async fn test_notifies_fan_out() {
        let store = RoomStore::new();
        let mut a = store.subscribe_notify();
        let mut b = store.subscribe_notify();
        store.add_notify(Notify::error("boom"));
        assert_eq!(a.recv().await.unwrap().text, "boom");
        assert_eq!(b.recv().await.unwrap().text, "boom");
    }
}
