use super::room_provider::{RoomProvider, RoomProviderError};
use crate::scheduler::TaskTable;
use async_trait::async_trait;
use shared::models::CallId;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[async_trait]
pub trait MonitorTarget: Send + Sync {
    async fn active_room(&self, call_id: CallId) -> Option<String>;
    async fn auto_end(&self, call_id: CallId);
}

/// Polls the participant count of every active call's room and ends calls
/// whose room has emptied out. At most one watcher per call.
pub struct RoomMonitor {
    rooms: Arc<dyn RoomProvider>,
    tasks: TaskTable<CallId>,
    interval: Duration,
    empty_threshold: u32,
}

impl RoomMonitor {
    pub fn new(rooms: Arc<dyn RoomProvider>, interval: Duration, empty_threshold: u32) -> Self {
        Self {
            rooms,
            tasks: TaskTable::new("room_monitor"),
            interval,
            empty_threshold,
        }
    }

    pub fn start(&self, call_id: CallId, target: Weak<dyn MonitorTarget>) {
        let watch = watch_room(
            call_id,
            target,
            self.rooms.clone(),
            self.interval,
            self.empty_threshold,
        );
        self.tasks.schedule(call_id, watch);
        debug!(call_id = %call_id, interval_secs = self.interval.as_secs(), "room monitor started");
    }

    pub fn stop(&self, call_id: CallId) -> bool {
        let stopped = self.tasks.cancel(&call_id);
        if stopped {
            debug!(call_id = %call_id, "room monitor stopped");
        }
        stopped
    }

    pub fn is_watching(&self, call_id: CallId) -> bool {
        self.tasks.contains(&call_id)
    }

    pub fn watching_count(&self) -> usize {
        self.tasks.len()
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.tasks.drain(grace).await;
    }
}

async fn watch_room(
    call_id: CallId,
    target: Weak<dyn MonitorTarget>,
    rooms: Arc<dyn RoomProvider>,
    period: Duration,
    empty_threshold: u32,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(target) = target.upgrade() else {
            return;
        };
        let Some(room_name) = target.active_room(call_id).await else {
            debug!(call_id = %call_id, "call no longer active, room monitor exiting");
            return;
        };

        let count = match rooms.participant_count(&room_name).await {
            Ok(count) => count,
            // expired or deleted on the provider side: nobody can be in it
            Err(RoomProviderError::NotFound(_)) => 0,
            Err(err) => {
                warn!(call_id = %call_id, room = %room_name, error = %err, "participant poll failed");
                continue;
            }
        };
        if count <= empty_threshold {
            info!(call_id = %call_id, room = %room_name, count, "room emptied, ending call");
            // detached so the teardown's own stop() cannot cut it short
            tokio::spawn(async move { target.auto_end(call_id).await });
            return;
        }
        debug!(call_id = %call_id, count, "room still occupied");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::room_provider::LocalRoomProvider;
    use shared::models::RoomInfo;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    struct Target {
        room: Mutex<Option<String>>,
        ended: AtomicUsize,
    }

    impl Target {
        fn new(room: &str) -> Arc<Self> {
            Arc::new(Self {
                room: Mutex::new(Some(room.to_string())),
                ended: AtomicUsize::new(0),
            })
        }

        fn weak(self: &Arc<Self>) -> Weak<dyn MonitorTarget> {
            let target: Arc<dyn MonitorTarget> = self.clone();
            Arc::downgrade(&target)
        }
    }

    #[async_trait]
    impl MonitorTarget for Target {
        async fn active_room(&self, _call_id: CallId) -> Option<String> {
            self.room.lock().unwrap().clone()
        }

        async fn auto_end(&self, _call_id: CallId) {
            self.ended.fetch_add(1, Ordering::SeqCst);
            self.room.lock().unwrap().take();
        }
    }

    /// Fails the first `failures` polls, then reports `count`.
    struct FlakyRooms {
        failures: AtomicU32,
        count: u32,
    }

    #[async_trait]
    impl RoomProvider for FlakyRooms {
        async fn create_room(&self, name: &str) -> Result<RoomInfo, RoomProviderError> {
            Ok(RoomInfo { name: name.to_string(), url: String::new() })
        }

        async fn delete_room(&self, _name: &str) -> Result<(), RoomProviderError> {
            Ok(())
        }

        async fn participant_count(&self, _name: &str) -> Result<u32, RoomProviderError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(RoomProviderError::Status { status: 503, body: String::new() });
            }
            Ok(self.count)
        }
    }

    async fn local_room(count: u32) -> (Arc<LocalRoomProvider>, String) {
        let rooms = Arc::new(LocalRoomProvider::new("http://localhost", count));
        let name = "call-test".to_string();
        rooms.create_room(&name).await.unwrap();
        (rooms, name)
    }

    #[tokio::test(start_paused = true)]
    async fn occupied_room_keeps_call_alive() {
        let (rooms, name) = local_room(2).await;
        let monitor = RoomMonitor::new(rooms, Duration::from_secs(10), 1);
        let target = Target::new(&name);
        let call_id = Uuid::new_v4();
        monitor.start(call_id, target.weak());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(target.ended.load(Ordering::SeqCst), 0);
        assert!(monitor.is_watching(call_id));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_room_ends_call_once() {
        let (rooms, name) = local_room(2).await;
        let monitor = RoomMonitor::new(rooms.clone(), Duration::from_secs(10), 1);
        let target = Target::new(&name);
        let call_id = Uuid::new_v4();
        monitor.start(call_id, target.weak());

        tokio::time::sleep(Duration::from_secs(15)).await;
        rooms.set_participant_count(&name, 1).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(target.ended.load(Ordering::SeqCst), 1);
        assert!(!monitor.is_watching(call_id));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_monitor_never_fires() {
        let (rooms, name) = local_room(0).await;
        let monitor = RoomMonitor::new(rooms, Duration::from_secs(10), 1);
        let target = Target::new(&name);
        let call_id = Uuid::new_v4();
        monitor.start(call_id, target.weak());
        assert!(monitor.stop(call_id));
        assert!(!monitor.stop(call_id));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(target.ended.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_do_not_end_call() {
        let rooms = Arc::new(FlakyRooms { failures: AtomicU32::new(2), count: 0 });
        let monitor = RoomMonitor::new(rooms, Duration::from_secs(10), 1);
        let target = Target::new("call-test");
        monitor.start(Uuid::new_v4(), target.weak());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(target.ended.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(target.ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_room_counts_as_empty() {
        let rooms = Arc::new(LocalRoomProvider::new("http://localhost", 2));
        let monitor = RoomMonitor::new(rooms, Duration::from_secs(10), 1);
        let target = Target::new("call-never-created");
        let call_id = Uuid::new_v4();
        monitor.start(call_id, target.weak());

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(target.ended.load(Ordering::SeqCst), 1);
        assert!(!monitor.is_watching(call_id));
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_call_stops_watching() {
        let (rooms, name) = local_room(0).await;
        let monitor = RoomMonitor::new(rooms, Duration::from_secs(10), 1);
        let target = Target::new(&name);
        target.room.lock().unwrap().take();
        let call_id = Uuid::new_v4();
        monitor.start(call_id, target.weak());

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(target.ended.load(Ordering::SeqCst), 0);
        assert!(!monitor.is_watching(call_id));
    }
}
