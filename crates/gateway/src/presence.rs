// Presence Coordinator
//
// Turns raw connect/disconnect traffic into debounced online/offline
// announcements for a user's friends.
//
// Per user there is at most one pending-online and one pending-offline timer.
// Registry and directory writes happen immediately; only the announcements wait.
//
//   connect     register, mark online, cancel pending-offline.
//               If the offline announcement never started this was a flap:
//               nothing is announced, unless the previous online announcement
//               was itself cancelled before it went out. Otherwise the first
//               local connection arms pending-online.
//   disconnect  unregister. With devices left, drop just this connection from
//               the directory. With none left, cancel pending-online and arm
//               pending-offline.
//   online fire     friends -> online subset -> HAS_NEW_ONLINE_USER each
//   offline fire    skip if the user is connected on another instance, else
//                   friends -> online subset -> re-check other instances ->
//                   HAS_NEW_OFFLINE_USER each, then evict this instance's
//                   departed connections.
//
// Each armed timer gets a fresh generation from a coordinator-wide counter. A
// fired timer re-checks that its generation is still the armed one before it
// touches shared state, so a continuation that outlives its cancellation does
// nothing.

use crate::registry::{Connection, ConnectionRegistry};
use beacon_broker::{online_subset, Directory, EventBus, FriendLookup, PresenceEvent};
use beacon_core::{PresenceConfig, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    PendingOnline,
    PendingOffline,
}

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
    /// Set once the deadline passed and the announcement started
    fired: Arc<AtomicBool>,
    /// Connections this instance still has to remove from the directory
    departed: Vec<String>,
    /// Pending-offline only: the online announcement before it never went out
    online_unannounced: bool,
}

impl ArmedTimer {
    /// Abort the timer; true if its announcement had already started
    fn cancel(&self) -> bool {
        self.handle.abort();
        self.fired.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct TimerSlot {
    online: Option<ArmedTimer>,
    offline: Option<ArmedTimer>,
}

impl TimerSlot {
    fn get(&self, kind: TimerKind) -> Option<&ArmedTimer> {
        match kind {
            TimerKind::PendingOnline => self.online.as_ref(),
            TimerKind::PendingOffline => self.offline.as_ref(),
        }
    }

    fn take(&mut self, kind: TimerKind) -> Option<ArmedTimer> {
        match kind {
            TimerKind::PendingOnline => self.online.take(),
            TimerKind::PendingOffline => self.offline.take(),
        }
    }

    fn set(&mut self, kind: TimerKind, timer: ArmedTimer) {
        match kind {
            TimerKind::PendingOnline => self.online = Some(timer),
            TimerKind::PendingOffline => self.offline = Some(timer),
        }
    }

    fn is_empty(&self) -> bool {
        self.online.is_none() && self.offline.is_none()
    }
}

pub struct PresenceCoordinator {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<dyn Directory>,
    friends: Arc<dyn FriendLookup>,
    bus: EventBus,
    online_delay: Duration,
    offline_delay: Duration,
    timers: Mutex<HashMap<String, TimerSlot>>,
    generation: AtomicU64,
}

impl PresenceCoordinator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<dyn Directory>,
        friends: Arc<dyn FriendLookup>,
        bus: EventBus,
        config: &PresenceConfig,
    ) -> Self {
        Self {
            registry,
            directory,
            friends,
            bus,
            online_delay: config.online_delay(),
            offline_delay: config.offline_delay(),
            timers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn has_pending(&self, user_id: &str, kind: TimerKind) -> bool {
        self.lock_timers()
            .get(user_id)
            .map(|slot| slot.get(kind).is_some())
            .unwrap_or(false)
    }

    /// A socket was accepted and authenticated
    pub async fn connect(self: &Arc<Self>, connection: Connection) {
        let user_id = connection.user_id.clone();
        let connection_id = connection.connection_id.clone();
        let local = self.registry.register(connection).await;

        let mut flapped = false;
        let mut online_owed = false;
        if let Some(pending) = self.take_timer(&user_id, TimerKind::PendingOffline) {
            let announced = pending.cancel();
            self.evict(&user_id, &pending.departed).await;
            flapped = !announced;
            online_owed = pending.online_unannounced;
        }

        if let Err(e) = self.directory.mark_online(&user_id, &connection_id).await {
            tracing::warn!(
                user_id = %user_id,
                connection_id = %connection_id,
                error = %e,
                "Directory update failed on connect"
            );
        }

        if flapped && !online_owed {
            tracing::debug!(user_id = %user_id, "Reconnected within offline window");
            return;
        }
        if local > 1 {
            tracing::debug!(user_id = %user_id, local, "Another device is connected here, nothing to announce");
            return;
        }
        self.arm(&user_id, TimerKind::PendingOnline, Vec::new(), false);
    }

    /// A socket closed, cleanly or not
    pub async fn disconnect(self: &Arc<Self>, user_id: &str, connection_id: &str) {
        let remaining = self.registry.unregister(user_id, connection_id).await;
        if remaining > 0 {
            if let Err(e) = self
                .directory
                .mark_offline_connection(user_id, connection_id)
                .await
            {
                tracing::warn!(user_id, connection_id, error = %e, "Directory update failed on disconnect");
            }
            tracing::debug!(user_id, remaining, "Device disconnected, user still connected here");
            return;
        }

        let mut online_unannounced = false;
        if let Some(pending) = self.take_timer(user_id, TimerKind::PendingOnline) {
            online_unannounced = !pending.cancel();
            tracing::debug!(user_id, "Cancelled pending online announcement");
        }
        self.arm(
            user_id,
            TimerKind::PendingOffline,
            vec![connection_id.to_string()],
            online_unannounced,
        );
    }

    /// Friends of `user_id` that are online anywhere in the fleet
    pub async fn online_friends(&self, user_id: &str) -> Vec<String> {
        let Some(friends) = self.friends.friends_of(user_id).await else {
            return Vec::new();
        };
        match self.online_among(user_id, &friends).await {
            Ok(online) => online,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Directory read failed");
                Vec::new()
            }
        }
    }

    /// Abort every pending timer
    pub fn cancel_all(&self) {
        let mut timers = self.lock_timers();
        for (_, slot) in timers.drain() {
            for timer in [slot.online, slot.offline].into_iter().flatten() {
                timer.cancel();
            }
        }
    }

    fn lock_timers(&self) -> MutexGuard<'_, HashMap<String, TimerSlot>> {
        self.timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn delay(&self, kind: TimerKind) -> Duration {
        match kind {
            TimerKind::PendingOnline => self.online_delay,
            TimerKind::PendingOffline => self.offline_delay,
        }
    }

    fn take_timer(&self, user_id: &str, kind: TimerKind) -> Option<ArmedTimer> {
        let mut timers = self.lock_timers();
        let slot = timers.get_mut(user_id)?;
        let timer = slot.take(kind);
        if slot.is_empty() {
            timers.remove(user_id);
        }
        timer
    }

    fn is_current(&self, user_id: &str, kind: TimerKind, generation: u64) -> bool {
        self.lock_timers()
            .get(user_id)
            .and_then(|slot| slot.get(kind))
            .map(|timer| timer.generation == generation)
            .unwrap_or(false)
    }

    fn finish(&self, user_id: &str, kind: TimerKind, generation: u64) {
        let mut timers = self.lock_timers();
        if let Some(slot) = timers.get_mut(user_id) {
            if slot.get(kind).map(|t| t.generation) == Some(generation) {
                slot.take(kind);
            }
            if slot.is_empty() {
                timers.remove(user_id);
            }
        }
    }

    /// Arm (or re-arm) a timer; a previous timer of the same kind is superseded
    fn arm(
        self: &Arc<Self>,
        user_id: &str,
        kind: TimerKind,
        mut departed: Vec<String>,
        mut online_unannounced: bool,
    ) {
        let delay = self.delay(kind);
        let mut timers = self.lock_timers();
        let slot = timers.entry(user_id.to_string()).or_default();
        if let Some(previous) = slot.take(kind) {
            previous.cancel();
            departed.extend(previous.departed);
            online_unannounced |= previous.online_unannounced;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let fired = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn({
            let this = Arc::clone(self);
            let user_id = user_id.to_string();
            let fired = fired.clone();
            let departed = departed.clone();
            async move {
                tokio::time::sleep(delay).await;
                if !this.is_current(&user_id, kind, generation) {
                    return;
                }
                fired.store(true, Ordering::SeqCst);
                match kind {
                    TimerKind::PendingOnline => this.announce_online(&user_id, generation).await,
                    TimerKind::PendingOffline => {
                        this.announce_offline(&user_id, generation, &departed).await
                    }
                }
                this.finish(&user_id, kind, generation);
            }
        });

        slot.set(
            kind,
            ArmedTimer {
                generation,
                handle,
                fired,
                departed,
                online_unannounced,
            },
        );
        tracing::debug!(user_id, ?kind, delay_ms = delay.as_millis() as u64, "Presence timer armed");
    }

    async fn announce_online(&self, user_id: &str, generation: u64) {
        let Some(friends) = self.friends.friends_of(user_id).await else {
            tracing::info!(user_id, "Friend list unknown, skipping online announcement");
            return;
        };
        let targets = match self.online_among(user_id, &friends).await {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Directory read failed, skipping online announcement");
                return;
            }
        };
        if !self.is_current(user_id, TimerKind::PendingOnline, generation) {
            return;
        }

        self.warn_if_degraded(user_id, "online");
        for friend in &targets {
            self.bus.emit(PresenceEvent::online(friend.as_str(), user_id)).await;
        }
        tracing::info!(user_id, notified = targets.len(), "Announced online");
    }

    async fn announce_offline(&self, user_id: &str, generation: u64, departed: &[String]) {
        if self.connected_elsewhere(user_id, departed).await {
            tracing::debug!(user_id, "Still connected on another instance, no offline announcement");
        } else {
            match self.friends.friends_of(user_id).await {
                None => {
                    tracing::info!(user_id, "Friend list unknown, skipping offline announcement")
                }
                Some(friends) => match self.online_among(user_id, &friends).await {
                    Ok(targets) => {
                        if !self.is_current(user_id, TimerKind::PendingOffline, generation) {
                            return;
                        }
                        // The friend lookup can outlast a reconnect on another instance
                        if self.connected_elsewhere(user_id, departed).await {
                            tracing::debug!(user_id, "Reconnected on another instance, no offline announcement");
                            self.evict(user_id, departed).await;
                            return;
                        }
                        self.warn_if_degraded(user_id, "offline");
                        for friend in &targets {
                            self.bus.emit(PresenceEvent::offline(friend.as_str(), user_id)).await;
                        }
                        tracing::info!(user_id, notified = targets.len(), "Announced offline");
                    }
                    Err(e) => {
                        tracing::warn!(user_id, error = %e, "Directory read failed, skipping offline announcement")
                    }
                },
            }
        }

        // A reconnect that superseded this timer evicts on its own
        if self.is_current(user_id, TimerKind::PendingOffline, generation) {
            self.evict(user_id, departed).await;
        }
    }

    async fn online_among(&self, user_id: &str, friends: &[String]) -> Result<Vec<String>> {
        let candidates: Vec<String> = friends.iter().filter(|f| *f != user_id).cloned().collect();
        online_subset(self.directory.as_ref(), &candidates).await
    }

    fn warn_if_degraded(&self, user_id: &str, announcement: &str) {
        if self.bus.is_degraded() {
            tracing::warn!(
                user_id,
                announcement,
                "Broker degraded, friends on other instances may miss this announcement"
            );
        }
    }

    /// Directory holds a connection for `user_id` other than the departed ones
    async fn connected_elsewhere(&self, user_id: &str, departed: &[String]) -> bool {
        match self.directory.connections_for(user_id).await {
            Ok(ids) => ids.iter().any(|id| !departed.contains(id)),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Directory read failed");
                false
            }
        }
    }

    async fn evict(&self, user_id: &str, connection_ids: &[String]) {
        for connection_id in connection_ids {
            if let Err(e) = self
                .directory
                .mark_offline_connection(user_id, connection_id)
                .await
            {
                tracing::warn!(user_id, connection_id = %connection_id, error = %e, "Directory eviction failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_broker::{
        CorrelationClient, EventKind, FriendDirectoryClient, MemoryDirectory, MemoryTransport,
        PresenceStream, StaticFriends, Transport,
    };
    use beacon_core::BusConfig;
    use futures_util::StreamExt;
    use crate::registry::frame_channel;
    use tokio::time::sleep;

    struct Harness {
        coordinator: Arc<PresenceCoordinator>,
        directory: MemoryDirectory,
        friends: Arc<StaticFriends>,
        events: PresenceStream,
    }

    async fn harness() -> Harness {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let friends = Arc::new(StaticFriends::new());
        let built = build(transport, friends.clone()).await;
        Harness {
            coordinator: built.coordinator,
            directory: built.directory,
            friends,
            events: built.events,
        }
    }

    struct Built {
        coordinator: Arc<PresenceCoordinator>,
        directory: MemoryDirectory,
        events: PresenceStream,
    }

    async fn build(transport: Arc<dyn Transport>, friends: Arc<dyn FriendLookup>) -> Built {
        let bus = EventBus::new(transport, BusConfig::default());
        let events = bus.subscribe().await.unwrap();
        let directory = MemoryDirectory::new();
        let coordinator = Arc::new(PresenceCoordinator::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(directory.clone()),
            friends,
            bus,
            &PresenceConfig::default(),
        ));
        Built {
            coordinator,
            directory,
            events,
        }
    }

    fn connection(user_id: &str) -> Connection {
        let (tx, _rx) = frame_channel();
        Connection::new(user_id, "gw-test", tx)
    }

    async fn drain(events: &mut PresenceStream) -> Vec<PresenceEvent> {
        let mut out = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(1), events.next()).await {
            out.push(event);
        }
        out
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_announced_to_online_friends_only() {
        let mut h = harness().await;
        h.friends.set("alice", &["bob", "carol"]);
        h.directory.mark_online("bob", "remote-bob").await.unwrap();

        h.coordinator.connect(connection("alice")).await;
        assert!(h.directory.is_online("alice").await.unwrap());

        sleep(secs(9)).await;
        assert!(drain(&mut h.events).await.is_empty());

        sleep(secs(2)).await;
        assert_eq!(
            drain(&mut h.events).await,
            vec![PresenceEvent::online("bob", "alice")]
        );
        assert!(!h.coordinator.has_pending("alice", TimerKind::PendingOnline));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_reconnect_emits_nothing() {
        let mut h = harness().await;
        h.friends.set("alice", &["bob"]);
        h.directory.mark_online("bob", "remote-bob").await.unwrap();

        let first = connection("alice");
        let first_id = first.connection_id.clone();
        h.coordinator.connect(first).await;
        sleep(secs(11)).await;
        assert_eq!(drain(&mut h.events).await.len(), 1);

        h.coordinator.disconnect("alice", &first_id).await;
        assert!(h.coordinator.has_pending("alice", TimerKind::PendingOffline));
        sleep(secs(2)).await;

        let second = connection("alice");
        let second_id = second.connection_id.clone();
        h.coordinator.connect(second).await;
        sleep(secs(60)).await;

        assert!(drain(&mut h.events).await.is_empty());
        assert!(!h.coordinator.has_pending("alice", TimerKind::PendingOffline));
        assert!(!h.coordinator.has_pending("alice", TimerKind::PendingOnline));
        let ids = h.directory.connections_for("alice").await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![second_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_device_announces_once() {
        let mut h = harness().await;
        h.friends.set("alice", &["bob"]);
        h.directory.mark_online("bob", "remote-bob").await.unwrap();

        h.coordinator.connect(connection("alice")).await;
        sleep(secs(1)).await;
        h.coordinator.connect(connection("alice")).await;
        sleep(secs(30)).await;

        assert_eq!(
            drain(&mut h.events).await,
            vec![PresenceEvent::online("bob", "alice")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_device_disconnect() {
        let mut h = harness().await;
        h.friends.set("alice", &["bob"]);
        h.directory.mark_online("bob", "remote-bob").await.unwrap();

        let phone = connection("alice");
        let laptop = connection("alice");
        let (phone_id, laptop_id) = (phone.connection_id.clone(), laptop.connection_id.clone());
        h.coordinator.connect(phone).await;
        h.coordinator.connect(laptop).await;
        sleep(secs(11)).await;
        drain(&mut h.events).await;

        h.coordinator.disconnect("alice", &phone_id).await;
        assert!(h.directory.is_online("alice").await.unwrap());
        assert!(!h.coordinator.has_pending("alice", TimerKind::PendingOffline));

        h.coordinator.disconnect("alice", &laptop_id).await;
        assert!(h.coordinator.has_pending("alice", TimerKind::PendingOffline));

        sleep(secs(16)).await;
        assert_eq!(
            drain(&mut h.events).await,
            vec![PresenceEvent::offline("bob", "alice")]
        );
        assert!(!h.directory.is_online("alice").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_friend_list_skips_announcement() {
        let mut h = harness().await;
        h.directory.mark_online("bob", "remote-bob").await.unwrap();

        h.coordinator.connect(connection("alice")).await;
        sleep(secs(11)).await;

        assert!(drain(&mut h.events).await.is_empty());
        assert!(h.directory.is_online("alice").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_offline_while_connected_elsewhere() {
        let mut h = harness().await;
        h.friends.set("alice", &["bob"]);
        h.directory.mark_online("bob", "remote-bob").await.unwrap();

        let local = connection("alice");
        let local_id = local.connection_id.clone();
        h.coordinator.connect(local).await;
        sleep(secs(11)).await;
        drain(&mut h.events).await;

        h.directory.mark_online("alice", "remote-alice").await.unwrap();
        h.coordinator.disconnect("alice", &local_id).await;
        sleep(secs(16)).await;

        assert!(drain(&mut h.events).await.is_empty());
        let ids = h.directory.connections_for("alice").await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["remote-alice".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_online() {
        let mut h = harness().await;
        h.friends.set("alice", &["bob"]);
        h.directory.mark_online("bob", "remote-bob").await.unwrap();

        let conn = connection("alice");
        let conn_id = conn.connection_id.clone();
        h.coordinator.connect(conn).await;
        sleep(secs(3)).await;
        h.coordinator.disconnect("alice", &conn_id).await;
        assert!(!h.coordinator.has_pending("alice", TimerKind::PendingOnline));

        sleep(secs(30)).await;
        let events = drain(&mut h.events).await;
        assert!(events.iter().all(|e| e.kind != EventKind::Online));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flap_after_cancelled_online_still_announces() {
        let mut h = harness().await;
        h.friends.set("alice", &["bob"]);
        h.directory.mark_online("bob", "remote-bob").await.unwrap();

        let conn = connection("alice");
        let conn_id = conn.connection_id.clone();
        h.coordinator.connect(conn).await;
        sleep(secs(3)).await;
        h.coordinator.disconnect("alice", &conn_id).await;
        sleep(secs(2)).await;
        h.coordinator.connect(connection("alice")).await;
        assert!(h.coordinator.has_pending("alice", TimerKind::PendingOnline));

        sleep(secs(120)).await;
        assert_eq!(
            drain(&mut h.events).await,
            vec![PresenceEvent::online("bob", "alice")]
        );
        assert!(h.directory.is_online("alice").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flap_after_announced_online_stays_quiet() {
        let mut h = harness().await;
        h.friends.set("alice", &["bob"]);
        h.directory.mark_online("bob", "remote-bob").await.unwrap();

        let conn = connection("alice");
        let conn_id = conn.connection_id.clone();
        h.coordinator.connect(conn).await;
        sleep(secs(11)).await;
        drain(&mut h.events).await;

        // Two flaps in a row: the second offline timer inherits nothing owed
        h.coordinator.disconnect("alice", &conn_id).await;
        sleep(secs(2)).await;
        let again = connection("alice");
        let again_id = again.connection_id.clone();
        h.coordinator.connect(again).await;
        h.coordinator.disconnect("alice", &again_id).await;
        sleep(secs(2)).await;
        h.coordinator.connect(connection("alice")).await;

        sleep(secs(120)).await;
        assert!(drain(&mut h.events).await.is_empty());
    }

    /// Friend lookup that takes a while to answer
    struct SlowFriends {
        inner: StaticFriends,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl FriendLookup for SlowFriends {
        async fn friends_of(&self, user_id: &str) -> Option<Vec<String>> {
            sleep(self.delay).await;
            self.inner.friends_of(user_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_elsewhere_during_offline_announcement_converges_online() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let bus = EventBus::new(transport, BusConfig::default());
        let mut events = bus.subscribe().await.unwrap();
        let directory = MemoryDirectory::new();
        directory.mark_online("bob", "remote-bob").await.unwrap();

        let inner = StaticFriends::new();
        inner.set("alice", &["bob"]);
        let friends: Arc<dyn FriendLookup> = Arc::new(SlowFriends {
            inner,
            delay: secs(2),
        });
        let instance = || {
            Arc::new(PresenceCoordinator::new(
                Arc::new(ConnectionRegistry::new()),
                Arc::new(directory.clone()),
                friends.clone(),
                bus.clone(),
                &PresenceConfig::default(),
            ))
        };
        let (x, y) = (instance(), instance());

        let conn = connection("alice");
        let conn_id = conn.connection_id.clone();
        x.connect(conn).await;
        sleep(secs(15)).await;
        x.disconnect("alice", &conn_id).await;

        // X's offline timer fires at 30s and waits on the friend lookup until 32s
        sleep(secs(16)).await;
        y.connect(connection("alice")).await;
        sleep(secs(120)).await;

        let events = drain(&mut events).await;
        assert_eq!(events.last(), Some(&PresenceEvent::online("bob", "alice")));
        assert!(events.iter().all(|e| e.kind != EventKind::Offline));
        let ids = directory.connections_for("alice").await.unwrap();
        assert_eq!(ids.len(), 1);
        assert!(!ids.contains(&conn_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_offline_announced_goes_online_again() {
        let mut h = harness().await;
        h.friends.set("alice", &["bob"]);
        h.directory.mark_online("bob", "remote-bob").await.unwrap();

        let conn = connection("alice");
        let conn_id = conn.connection_id.clone();
        h.coordinator.connect(conn).await;
        sleep(secs(11)).await;
        h.coordinator.disconnect("alice", &conn_id).await;
        sleep(secs(16)).await;
        assert_eq!(drain(&mut h.events).await.len(), 2);

        h.coordinator.connect(connection("alice")).await;
        sleep(secs(11)).await;
        assert_eq!(
            drain(&mut h.events).await,
            vec![PresenceEvent::online("bob", "alice")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_friend_lookup_timeout_publishes_nothing() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let rpc = Arc::new(CorrelationClient::new(transport.clone(), "WS_SERVER", secs(30)));
        let friends = Arc::new(FriendDirectoryClient::new(rpc.clone(), "FRIEND_TOPIC"));
        let mut built = build(transport, friends).await;
        built.directory.mark_online("bob", "remote-bob").await.unwrap();

        built.coordinator.connect(connection("alice")).await;
        sleep(secs(45)).await;

        assert!(drain(&mut built.events).await.is_empty());
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_online_friends() {
        let h = harness().await;
        h.friends.set("alice", &["bob", "carol", "alice"]);
        h.directory.mark_online("carol", "c").await.unwrap();
        h.directory.mark_online("alice", "a").await.unwrap();

        assert_eq!(h.coordinator.online_friends("alice").await, vec!["carol".to_string()]);
        assert!(h.coordinator.online_friends("nobody").await.is_empty());
    }
}
