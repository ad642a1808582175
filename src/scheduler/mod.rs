/// Durable scheduled-event engine
///
/// Future work items live in the `scheduled_events` namespace, sorted by
/// fire time. The store is authoritative: every re-evaluation re-queries it,
/// delivers whatever is due in ascending order, then arms a single timer for
/// the nearest remaining event. Delivery is at-most-once: the record is
/// removed after its handler runs whether or not the handler succeeded.

use crate::{
    clock,
    error::IdpResult,
    metrics,
    store::{RecordStore, SortBound, SortOrder, Table},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const EVENTS: &str = "scheduled_events";

/// Back-off before retrying a pass that failed to read the store
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DeleteSession,
    DeleteAuthCode,
    DeleteRefreshToken,
    RefreshIdentity,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::DeleteSession,
        EventKind::DeleteAuthCode,
        EventKind::DeleteRefreshToken,
        EventKind::RefreshIdentity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DeleteSession => "delete_session",
            EventKind::DeleteAuthCode => "delete_auth_code",
            EventKind::DeleteRefreshToken => "delete_refresh_token",
            EventKind::RefreshIdentity => "refresh_identity",
        }
    }
}

/// Work carried by an event; the tag doubles as the event kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    DeleteSession { session_id: String },
    DeleteAuthCode { client_id: String, code: String },
    DeleteRefreshToken { token: String },
    RefreshIdentity { identity_id: String },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::DeleteSession { .. } => EventKind::DeleteSession,
            EventPayload::DeleteAuthCode { .. } => EventKind::DeleteAuthCode,
            EventPayload::DeleteRefreshToken { .. } => EventKind::DeleteRefreshToken,
            EventPayload::RefreshIdentity { .. } => EventKind::RefreshIdentity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub id: String,
    /// Epoch milliseconds
    pub fire_at: i64,
    pub payload: EventPayload,
}

/// Callback for one event kind
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ScheduledEvent) -> IdpResult<()>;
}

struct ArmedTimer {
    generation: u64,
    /// Fire time of the event the timer is waiting for
    target: i64,
    handle: JoinHandle<()>,
}

/// Decrements the live timer count when a timer task ends or is aborted
struct TimerGuard(Arc<AtomicUsize>);

impl TimerGuard {
    fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live)
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct EventScheduler {
    events: Table<ScheduledEvent>,
    handlers: RwLock<HashMap<EventKind, Arc<dyn EventHandler>>>,
    timer: Mutex<Option<ArmedTimer>>,
    generation: AtomicU64,
    live_timers: Arc<AtomicUsize>,
    evaluating: AtomicBool,
    rerun: AtomicBool,
    started: AtomicBool,
    max_timer_delay: Duration,
    me: Weak<EventScheduler>,
}

impl EventScheduler {
    pub fn new(store: RecordStore, max_timer_delay: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            events: Table::new(store, EVENTS).sorted_by(|event: &ScheduledEvent| event.fire_at),
            handlers: RwLock::new(HashMap::new()),
            timer: Mutex::new(None),
            generation: AtomicU64::new(0),
            live_timers: Arc::new(AtomicUsize::new(0)),
            evaluating: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            started: AtomicBool::new(false),
            max_timer_delay,
            me: me.clone(),
        })
    }

    /// Route events of `kind` to `handler`; done before `start`
    pub fn register(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.insert(kind, handler).is_some() {
            warn!(kind = kind.as_str(), "Replaced event handler");
        }
    }

    /// Deliver everything already due, then arm for the nearest future event
    pub async fn start(&self) -> IdpResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let due = self
            .events
            .range(SortBound::AtMost(clock::now_ms()), SortOrder::Ascending, None)
            .await?
            .len();
        info!("Starting event scheduler ({} event(s) due)", due);

        self.reevaluate().await;
        Ok(())
    }

    /// Stop arming timers; persisted events stay for the next start
    pub fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.disarm();
        info!("Event scheduler stopped");
    }

    /// Persist an event and re-arm if it is now the nearest
    pub async fn schedule(&self, payload: EventPayload, fire_at: i64) -> IdpResult<String> {
        let event = ScheduledEvent {
            id: format!("event-{}", Uuid::new_v4().simple()),
            fire_at,
            payload,
        };
        self.events.set(&event.id, &event).await?;

        debug!(
            event_id = %event.id,
            kind = event.payload.kind().as_str(),
            fire_at,
            "Scheduled event"
        );

        if self.needs_rearm(fire_at) {
            self.reevaluate().await;
        }

        Ok(event.id)
    }

    /// Remove an event; `false` when it already fired or never existed
    pub async fn cancel(&self, event_id: &str) -> IdpResult<bool> {
        let removed = self.events.delete(event_id).await?;
        if removed {
            debug!(event_id = %event_id, "Cancelled event");
            self.reevaluate().await;
        }
        Ok(removed)
    }

    pub async fn get(&self, event_id: &str) -> IdpResult<Option<ScheduledEvent>> {
        self.events.get(event_id).await
    }

    /// Pending events of one kind, nearest first
    pub async fn list_by_kind(&self, kind: EventKind) -> IdpResult<Vec<ScheduledEvent>> {
        let mut events: Vec<ScheduledEvent> = self
            .events
            .all()
            .await?
            .into_iter()
            .filter(|event| event.payload.kind() == kind)
            .collect();
        events.sort_by_key(|event| event.fire_at);
        Ok(events)
    }

    pub fn is_armed(&self) -> bool {
        self.timer_slot().is_some()
    }

    /// Fire time of the event the armed timer is waiting for
    pub fn armed_target(&self) -> Option<i64> {
        self.timer_slot().as_ref().map(|timer| timer.target)
    }

    /// Timer tasks currently alive
    pub fn live_timers(&self) -> usize {
        self.live_timers.load(Ordering::SeqCst)
    }

    fn needs_rearm(&self, fire_at: i64) -> bool {
        if !self.started.load(Ordering::SeqCst) {
            return false;
        }
        match self.timer_slot().as_ref() {
            Some(timer) => fire_at < timer.target,
            None => true,
        }
    }

    /// Run re-evaluation passes until no further request is pending
    ///
    /// A request arriving while a pass is in flight only raises `rerun`; the
    /// caller already running passes picks it up.
    async fn reevaluate(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }

        self.rerun.store(true, Ordering::SeqCst);
        loop {
            if self
                .evaluating
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            while self.rerun.swap(false, Ordering::AcqRel) {
                if let Err(e) = self.run_pass().await {
                    error!("Event scheduler pass failed: {}", e);
                    self.arm(clock::now_ms() + clock::duration_ms(RETRY_DELAY));
                }
            }

            self.evaluating.store(false, Ordering::Release);

            // A request may have landed between the last swap and the release
            if !self.rerun.load(Ordering::Acquire) {
                return;
            }
        }
    }

    async fn run_pass(&self) -> IdpResult<()> {
        self.disarm();
        if !self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        let now = clock::now_ms();
        let due = self
            .events
            .range(SortBound::AtMost(now), SortOrder::Ascending, None)
            .await?;
        for event in due {
            self.deliver(event).await;
        }

        let next = self
            .events
            .range(SortBound::After(now), SortOrder::Ascending, Some(1))
            .await?;
        if let Some(next) = next.into_iter().next() {
            self.arm(next.fire_at);
        }

        Ok(())
    }

    async fn deliver(&self, event: ScheduledEvent) {
        let kind = event.payload.kind();
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .cloned();

        let outcome = match handler {
            Some(handler) => match handler.handle(&event).await {
                Ok(()) => "delivered",
                Err(e) => {
                    error!(event_id = %event.id, kind = kind.as_str(), "Event handler failed: {}", e);
                    "failed"
                }
            },
            None => {
                warn!(event_id = %event.id, kind = kind.as_str(), "No handler registered for event");
                "unhandled"
            }
        };
        metrics::record_scheduled_event(kind.as_str(), outcome);

        if let Err(e) = self.events.delete(&event.id).await {
            error!(event_id = %event.id, "Failed to remove delivered event: {}", e);
        }
    }

    fn timer_slot(&self) -> MutexGuard<'_, Option<ArmedTimer>> {
        self.timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(&self, target: i64) {
        let wait_ms = (target - clock::now_ms()).max(0) as u64;
        // Longer waits are chained: the timer re-evaluates and re-arms
        let delay = Duration::from_millis(wait_ms).min(self.max_timer_delay);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let engine = self.me.clone();
        let guard = TimerGuard::new(Arc::clone(&self.live_timers));

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(engine) = engine.upgrade() else {
                return;
            };
            engine.release(generation);
            drop(guard);
            engine.reevaluate().await;
        });

        let previous = self.timer_slot().replace(ArmedTimer {
            generation,
            target,
            handle,
        });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    fn disarm(&self) {
        if let Some(timer) = self.timer_slot().take() {
            timer.handle.abort();
        }
    }

    /// Called by a firing timer so the pass it starts cannot abort it
    fn release(&self, generation: u64) {
        let mut slot = self.timer_slot();
        if slot.as_ref().map(|timer| timer.generation) == Some(generation) {
            slot.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IdpError;
    use std::sync::Mutex as StdMutex;
    use tokio::time::sleep;

    struct Recorder {
        delivered: StdMutex<Vec<(String, i64)>>,
        fail: bool,
    }

    impl Recorder {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delivered: StdMutex::new(Vec::new()),
                fail,
            })
        }

        fn ids(&self) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &ScheduledEvent) -> IdpResult<()> {
            self.delivered
                .lock()
                .unwrap()
                .push((event.id.clone(), clock::now_ms()));
            if self.fail {
                Err(IdpError::Internal("handler failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    async fn test_store() -> RecordStore {
        let pool = crate::db::create_memory_pool().await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        RecordStore::new(pool)
    }

    fn session_event(n: u32) -> EventPayload {
        EventPayload::DeleteSession {
            session_id: format!("session-{}", n),
        }
    }

    async fn started(store: RecordStore, recorder: Arc<Recorder>) -> Arc<EventScheduler> {
        let engine = EventScheduler::new(store, Duration::from_millis(2_147_483_647));
        engine.register(EventKind::DeleteSession, recorder);
        engine.start().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_delivers_once_not_before_fire_time() {
        let recorder = Recorder::new(false);
        let engine = started(test_store().await, recorder.clone()).await;

        let fire_at = clock::now_ms() + 150;
        let id = engine.schedule(session_event(1), fire_at).await.unwrap();
        assert!(engine.is_armed());

        sleep(Duration::from_millis(50)).await;
        assert!(recorder.ids().is_empty());

        sleep(Duration::from_millis(350)).await;
        let delivered = recorder.delivered.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, id);
        assert!(delivered[0].1 >= fire_at);
        assert!(delivered[0].1 - fire_at < 200);

        assert!(engine.get(&id).await.unwrap().is_none());
        assert!(!engine.is_armed());
    }

    #[tokio::test]
    async fn test_delivers_in_fire_time_order() {
        let recorder = Recorder::new(false);
        let engine = started(test_store().await, recorder.clone()).await;

        let now = clock::now_ms();
        let late = engine.schedule(session_event(1), now + 120).await.unwrap();
        let early = engine.schedule(session_event(2), now + 40).await.unwrap();
        let middle = engine.schedule(session_event(3), now + 80).await.unwrap();

        sleep(Duration::from_millis(400)).await;
        assert_eq!(recorder.ids(), vec![early, middle, late]);
    }

    #[tokio::test]
    async fn test_cancel() {
        let recorder = Recorder::new(false);
        let engine = started(test_store().await, recorder.clone()).await;

        let id = engine
            .schedule(session_event(1), clock::now_ms() + 100)
            .await
            .unwrap();
        assert!(engine.cancel(&id).await.unwrap());
        assert!(!engine.is_armed());

        sleep(Duration::from_millis(250)).await;
        assert!(recorder.ids().is_empty());

        // Cancelling again is a no-op
        assert!(!engine.cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_after_delivery_returns_false() {
        let recorder = Recorder::new(false);
        let engine = started(test_store().await, recorder.clone()).await;

        let id = engine
            .schedule(session_event(1), clock::now_ms() + 20)
            .await
            .unwrap();
        sleep(Duration::from_millis(200)).await;

        assert_eq!(recorder.ids(), vec![id.clone()]);
        assert!(!engine.cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_handler_still_removes_event() {
        let recorder = Recorder::new(true);
        let engine = started(test_store().await, recorder.clone()).await;

        let id = engine
            .schedule(session_event(1), clock::now_ms() + 20)
            .await
            .unwrap();
        sleep(Duration::from_millis(300)).await;

        assert_eq!(recorder.ids(), vec![id.clone()]);
        assert!(engine.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unhandled_kind_is_dropped() {
        let recorder = Recorder::new(false);
        let engine = started(test_store().await, recorder.clone()).await;

        let id = engine
            .schedule(
                EventPayload::DeleteRefreshToken {
                    token: "t".to_string(),
                },
                clock::now_ms() - 1,
            )
            .await
            .unwrap();

        assert!(engine.get(&id).await.unwrap().is_none());
        assert!(recorder.ids().is_empty());
    }

    #[tokio::test]
    async fn test_restart_delivers_due_events_first() {
        let store = test_store().await;
        let now = clock::now_ms();

        // Persisted by a previous process that never started its timer
        let first = EventScheduler::new(store.clone(), Duration::from_secs(60));
        let overdue_b = first.schedule(session_event(1), now - 500).await.unwrap();
        let overdue_a = first.schedule(session_event(2), now - 1000).await.unwrap();
        let future = first.schedule(session_event(3), now + 150).await.unwrap();
        assert!(!first.is_armed());
        drop(first);

        let recorder = Recorder::new(false);
        let engine = started(store, recorder.clone()).await;

        // Due events are delivered by start itself, oldest first
        assert_eq!(recorder.ids(), vec![overdue_a.clone(), overdue_b.clone()]);
        assert_eq!(engine.armed_target(), Some(now + 150));

        sleep(Duration::from_millis(400)).await;
        assert_eq!(recorder.ids(), vec![overdue_a, overdue_b, future]);
    }

    #[tokio::test]
    async fn test_long_delays_are_chained() {
        let recorder = Recorder::new(false);
        let engine = EventScheduler::new(test_store().await, Duration::from_millis(25));
        engine.register(EventKind::DeleteSession, recorder.clone());
        engine.start().await.unwrap();

        let fire_at = clock::now_ms() + 150;
        engine.schedule(session_event(1), fire_at).await.unwrap();

        sleep(Duration::from_millis(80)).await;
        assert!(recorder.ids().is_empty());

        sleep(Duration::from_millis(300)).await;
        let delivered = recorder.delivered.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].1 >= fire_at);
    }

    #[tokio::test]
    async fn test_at_most_one_timer() {
        let recorder = Recorder::new(false);
        let engine = started(test_store().await, recorder.clone()).await;

        let now = clock::now_ms();
        let mut tasks = Vec::new();
        for n in 0..20u32 {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                engine
                    .schedule(session_event(n), now + 200 + (n as i64 * 7) % 50)
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        sleep(Duration::from_millis(20)).await;
        assert!(engine.is_armed());
        assert_eq!(engine.live_timers(), 1);
        assert_eq!(engine.armed_target(), Some(now + 200));

        sleep(Duration::from_millis(500)).await;
        let mut ids = recorder.ids();
        assert_eq!(ids.len(), 20);
        ids.dedup();
        assert_eq!(ids.len(), 20);
        assert_eq!(engine.live_timers(), 0);
    }

    struct Rescheduler {
        engine: Weak<EventScheduler>,
        count: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Rescheduler {
        async fn handle(&self, event: &ScheduledEvent) -> IdpResult<()> {
            if self.count.fetch_add(1, Ordering::SeqCst) < 2 {
                if let Some(engine) = self.engine.upgrade() {
                    engine
                        .schedule(event.payload.clone(), clock::now_ms() + 30)
                        .await?;
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_can_reschedule_itself() {
        let engine = EventScheduler::new(test_store().await, Duration::from_secs(60));
        let handler = Arc::new(Rescheduler {
            engine: Arc::downgrade(&engine),
            count: AtomicUsize::new(0),
        });
        engine.register(EventKind::RefreshIdentity, handler.clone());
        engine.start().await.unwrap();

        engine
            .schedule(
                EventPayload::RefreshIdentity {
                    identity_id: "id-1".to_string(),
                },
                clock::now_ms() + 10,
            )
            .await
            .unwrap();

        sleep(Duration::from_millis(400)).await;
        assert_eq!(handler.count.load(Ordering::SeqCst), 3);
        assert!(engine
            .list_by_kind(EventKind::RefreshIdentity)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_list_by_kind() {
        let engine = EventScheduler::new(test_store().await, Duration::from_secs(60));
        let now = clock::now_ms();
        engine.schedule(session_event(1), now + 2000).await.unwrap();
        engine.schedule(session_event(2), now + 1000).await.unwrap();
        engine
            .schedule(
                EventPayload::DeleteRefreshToken {
                    token: "t".to_string(),
                },
                now + 500,
            )
            .await
            .unwrap();

        let sessions = engine.list_by_kind(EventKind::DeleteSession).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].payload, session_event(2));
    }

    #[test]
    fn test_payload_encoding_carries_kind() {
        let payload = EventPayload::DeleteAuthCode {
            client_id: "c".to_string(),
            code: "x".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "delete_auth_code");
        assert_eq!(payload.kind().as_str(), "delete_auth_code");

        let decoded: EventPayload = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, payload);
    }
}
