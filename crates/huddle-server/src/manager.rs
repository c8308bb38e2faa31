//! Registry of live hubs, created lazily and reclaimed when idle.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::gauge;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use huddle_core::RoomId;
use huddle_store::ChatStore;

use crate::config::HubConfig;
use crate::hub::Hub;
use crate::metrics::HUBS_ACTIVE;

/// Cloneable handle; all clones share one registry.
#[derive(Clone)]
pub struct HubManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    hubs: Mutex<HashMap<RoomId, Hub>>,
    store: Arc<dyn ChatStore>,
    config: HubConfig,
}

impl ManagerInner {
    /// Drop `hub` from the registry unless the room already maps to a newer hub.
    fn forget(&self, hub: &Hub) -> bool {
        let mut hubs = self.hubs.lock();
        let current = hubs
            .get(&hub.room_id())
            .is_some_and(|registered| registered.same_hub(hub));
        if current {
            hubs.remove(&hub.room_id());
            gauge!(HUBS_ACTIVE).set(hubs.len() as f64);
        }
        current
    }
}

impl HubManager {
    pub fn new(store: Arc<dyn ChatStore>, config: HubConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                hubs: Mutex::new(HashMap::new()),
                store,
                config,
            }),
        }
    }

    /// The live hub for `room_id`, creating one if none exists or the existing
    /// one is shutting down. Must be called inside a tokio runtime.
    pub fn get_or_create(&self, room_id: RoomId) -> Hub {
        let mut hubs = self.inner.hubs.lock();
        if let Some(hub) = hubs.get(&room_id) {
            if !hub.is_shutting_down() {
                return hub.clone();
            }
            debug!(room_id = %room_id, "replacing hub that is shutting down");
        }

        let span = info_span!("hub", room_id = %room_id);
        let (hub, _loop) = Hub::spawn(room_id, Arc::clone(&self.inner.store), span.clone());
        tokio::spawn(
            watch_idle(
                Arc::downgrade(&self.inner),
                hub.clone(),
                self.inner.config.idle_check_interval(),
                self.inner.config.idle_timeout(),
            )
            .instrument(span),
        );
        hubs.insert(room_id, hub.clone());
        gauge!(HUBS_ACTIVE).set(hubs.len() as f64);
        info!(room_id = %room_id, "hub created");
        hub
    }

    /// The registered hub for `room_id`, if any.
    pub fn get(&self, room_id: RoomId) -> Option<Hub> {
        self.inner.hubs.lock().get(&room_id).cloned()
    }

    /// Stop and evict every hub its own loop confirms is empty. Returns how
    /// many went. A hub that admits someone before the check is kept.
    pub async fn sweep(&self) -> usize {
        let candidates: Vec<Hub> = self
            .inner
            .hubs
            .lock()
            .values()
            .filter(|hub| hub.member_count() == 0)
            .cloned()
            .collect();

        let mut swept = 0;
        for hub in candidates {
            if hub.shutdown_if_idle(Duration::ZERO).await && self.inner.forget(&hub) {
                debug!(room_id = %hub.room_id(), "swept empty hub");
                swept += 1;
            }
        }
        if swept > 0 {
            info!(swept, remaining = self.hub_count(), "swept empty hubs");
        }
        swept
    }

    /// Run `sweep` every configured interval until `cancel` fires.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.inner.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep().await;
                    }
                }
            }
            debug!("hub sweeper stopped");
        })
    }

    /// Shut down every hub and clear the registry.
    pub fn shutdown_all(&self) {
        let drained: Vec<Hub> = {
            let mut hubs = self.inner.hubs.lock();
            hubs.drain().map(|(_, hub)| hub).collect()
        };
        for hub in &drained {
            hub.shutdown();
        }
        gauge!(HUBS_ACTIVE).set(0.0);
        info!(hubs = drained.len(), "all hubs shut down");
    }

    pub fn hub_count(&self) -> usize {
        self.inner.hubs.lock().len()
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.inner.hubs.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Sessions admitted across all hubs.
    pub fn connection_count(&self) -> usize {
        self.inner
            .hubs
            .lock()
            .values()
            .map(Hub::member_count)
            .sum()
    }
}

/// Per-hub timer: asks the hub to stop once it has been empty and idle past
/// `timeout`, and forgets it only when the hub's loop agrees. Exits as soon
/// as the hub stops for any reason.
async fn watch_idle(manager: Weak<ManagerInner>, hub: Hub, check: Duration, timeout: Duration) {
    let mut ticker = interval_at(Instant::now() + check, check);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = hub.closed() => return,
            _ = ticker.tick() => {}
        }
        if hub.is_shutting_down() {
            return;
        }
        if hub.member_count() > 0 || hub.idle_for() < timeout {
            continue;
        }
        if hub.shutdown_if_idle(timeout).await {
            info!(idle_secs = timeout.as_secs(), "idle hub shut down");
            if let Some(manager) = manager.upgrade() {
                manager.forget(&hub);
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Member;
    use crate::testing::MemoryStore;
    use huddle_core::{SessionToken, UserId};
    use tokio::sync::mpsc;

    fn manager_with(config: HubConfig) -> HubManager {
        HubManager::new(Arc::new(MemoryStore::with_users(&[(1, "a")])), config)
    }

    fn fast_idle() -> HubConfig {
        HubConfig {
            idle_timeout_secs: 60,
            idle_check_interval_secs: 30,
            sweep_interval_secs: 300,
        }
    }

    async fn admit(hub: &Hub, tok: &str) -> mpsc::Receiver<Arc<str>> {
        let (tx, rx) = mpsc::channel(8);
        hub.admit(Member::new(SessionToken::from_raw(tok), UserId::new(1), tx))
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn same_room_returns_same_hub() {
        let manager = manager_with(HubConfig::default());
        let first = manager.get_or_create(RoomId::new(3));
        let second = manager.get_or_create(RoomId::new(3));
        let other = manager.get_or_create(RoomId::new(4));

        assert!(first.same_hub(&second));
        assert!(!first.same_hub(&other));
        assert_eq!(manager.room_ids(), [RoomId::new(3), RoomId::new(4)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lookups_create_one_hub() {
        let manager = manager_with(HubConfig::default());
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_or_create(RoomId::new(7)) })
            })
            .collect();

        let hubs: Vec<Hub> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert!(hubs.iter().all(|hub| hub.same_hub(&hubs[0])));
        assert_eq!(manager.hub_count(), 1);
    }

    #[tokio::test]
    async fn shutting_down_hub_is_replaced() {
        let manager = manager_with(HubConfig::default());
        let old = manager.get_or_create(RoomId::new(1));
        old.shutdown();

        let fresh = manager.get_or_create(RoomId::new(1));
        assert!(!fresh.same_hub(&old));
        assert!(!fresh.is_shutting_down());
        assert_eq!(manager.hub_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_empty_hub_terminates_and_is_forgotten() {
        let manager = manager_with(fast_idle());
        let hub = manager.get_or_create(RoomId::new(5));

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(hub.is_shutting_down());
        assert!(manager.get(RoomId::new(5)).is_none());

        let next = manager.get_or_create(RoomId::new(5));
        assert!(!next.same_hub(&hub));
    }

    #[tokio::test(start_paused = true)]
    async fn occupied_hub_survives_idle_checks() {
        let manager = manager_with(fast_idle());
        let hub = manager.get_or_create(RoomId::new(5));
        let _rx = admit(&hub, "t").await;

        tokio::time::sleep(Duration::from_secs(300)).await;

        assert!(!hub.is_shutting_down());
        assert!(manager.get(RoomId::new(5)).is_some_and(|h| h.same_hub(&hub)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_does_not_evict_a_replacement() {
        let manager = manager_with(fast_idle());
        let old = manager.get_or_create(RoomId::new(2));
        old.shutdown();
        let fresh = manager.get_or_create(RoomId::new(2));
        let _rx = admit(&fresh, "keep").await;

        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(manager.get(RoomId::new(2)).is_some_and(|h| h.same_hub(&fresh)));
    }

    #[tokio::test]
    async fn sweep_evicts_only_empty_hubs() {
        let manager = manager_with(HubConfig::default());
        let empty = manager.get_or_create(RoomId::new(1));
        let busy = manager.get_or_create(RoomId::new(2));
        let _rx = admit(&busy, "t").await;

        assert_eq!(manager.sweep().await, 1);
        assert!(empty.is_shutting_down());
        assert!(!busy.is_shutting_down());
        assert_eq!(manager.room_ids(), [RoomId::new(2)]);
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn sweep_spares_a_hub_admitting_during_the_sweep() {
        let manager = manager_with(HubConfig::default());
        let hub = manager.get_or_create(RoomId::new(1));
        let (tx, mut rx) = mpsc::channel(8);

        let (admitted, swept) = tokio::join!(
            hub.admit(Member::new(SessionToken::from_raw("t"), UserId::new(1), tx)),
            manager.sweep(),
        );

        assert!(admitted.is_ok());
        assert_eq!(swept, 0);
        assert!(!hub.is_shutting_down());
        assert!(manager.get(RoomId::new(1)).is_some_and(|h| h.same_hub(&hub)));
        assert!(rx.try_recv().is_ok(), "admitted session got presence");
    }

    #[tokio::test]
    async fn sweep_skips_hub_already_replaced() {
        let manager = manager_with(HubConfig::default());
        let old = manager.get_or_create(RoomId::new(1));
        old.shutdown();
        old.closed().await;
        let fresh = manager.get_or_create(RoomId::new(1));
        let _rx = admit(&fresh, "t").await;

        assert_eq!(manager.sweep().await, 0);
        assert!(manager.get(RoomId::new(1)).is_some_and(|h| h.same_hub(&fresh)));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_on_interval_until_cancelled() {
        let manager = manager_with(HubConfig {
            sweep_interval_secs: 10,
            ..HubConfig::default()
        });
        let cancel = CancellationToken::new();
        let sweeper = manager.spawn_sweeper(cancel.clone());
        manager.get_or_create(RoomId::new(1));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(manager.hub_count(), 0);

        cancel.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_all_stops_every_hub() {
        let manager = manager_with(HubConfig::default());
        let a = manager.get_or_create(RoomId::new(1));
        let b = manager.get_or_create(RoomId::new(2));
        let mut rx = admit(&b, "t").await;

        manager.shutdown_all();

        assert_eq!(manager.hub_count(), 0);
        assert!(a.is_shutting_down() && b.is_shutting_down());
        while rx.recv().await.is_some() {}
    }
}
