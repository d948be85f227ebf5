//! Prioritized, in-process event bus (spec.md §4.1, §5).
//!
//! Grounded in `core/event_bus.py` (three independently-locked deques
//! drained by priority on a periodic tick) and generalized the way the
//! teacher's `EventBus`/`EventHandler` traits do it in `src/bus/mod.rs`:
//! a typed handler registry instead of dynamic dispatch over untyped
//! bodies (REDESIGN, spec.md §9).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::trace;

pub mod event;

pub use event::{DispensingPhase, Event, EventKind, PlanogramRejectReason};

/// Handler invoked synchronously on the dispatcher task. Must not block on
/// I/O; components that need to do work forward to their own worker queue
/// (spec.md §4.1).
pub trait Handler: Send + Sync {
    fn handle(&self, event: &Event);
}

impl<F> Handler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle(&self, event: &Event) {
        self(event)
    }
}

const HIGH_PRIO_BUDGET: usize = 15;
const NORMAL_PRIO_BUDGET: usize = 10;
const LOW_PRIO_BUDGET: usize = 5;
const DISPATCH_PERIOD: Duration = Duration::from_millis(100);

struct Queues {
    high: Mutex<VecDeque<Event>>,
    normal: Mutex<VecDeque<Event>>,
    low: Mutex<VecDeque<Event>>,
}

impl Default for Queues {
    fn default() -> Self {
        Self {
            high: Mutex::new(VecDeque::new()),
            normal: Mutex::new(VecDeque::new()),
            low: Mutex::new(VecDeque::new()),
        }
    }
}

/// Diagnostic snapshot of queue depth, following the teacher's habit of
/// exposing small introspection structs from its bus implementations.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventBusMetrics {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

/// Prioritized fan-out event bus. Cheaply cloneable; all state lives
/// behind `Arc`.
#[derive(Clone)]
pub struct EventBus {
    queues: Arc<Queues>,
    subscriptions: Arc<Mutex<HashMap<&'static str, Vec<Arc<dyn Handler>>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Queues::default()),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a handler for all events of the given kind discriminant.
    pub async fn subscribe(&self, kind: &'static str, handler: Arc<dyn Handler>) {
        self.subscriptions
            .lock()
            .await
            .entry(kind)
            .or_default()
            .push(handler);
    }

    pub async fn post_high(&self, event: Event) {
        self.queues.high.lock().await.push_back(event);
    }

    pub async fn post(&self, event: Event) {
        self.queues.normal.lock().await.push_back(event);
    }

    pub async fn post_low(&self, event: Event) {
        self.queues.low.lock().await.push_back(event);
    }

    pub async fn metrics(&self) -> EventBusMetrics {
        EventBusMetrics {
            high: self.queues.high.lock().await.len(),
            normal: self.queues.normal.lock().await.len(),
            low: self.queues.low.lock().await.len(),
        }
    }

    /// Drain up to `budget` events from one queue in FIFO order, invoking
    /// every subscribed handler for each. The queue lock is released
    /// before invoking handlers so a handler may itself post events
    /// (spec.md §4.1, "thread safety").
    async fn drain(&self, queue: &Mutex<VecDeque<Event>>, budget: usize) {
        for _ in 0..budget {
            let event = {
                let mut q = queue.lock().await;
                match q.pop_front() {
                    Some(e) => e,
                    None => return,
                }
            };
            trace!(kind = event.kind().as_str(), "dispatching event");
            let handlers = {
                let subs = self.subscriptions.lock().await;
                subs.get(event.kind().as_str()).cloned().unwrap_or_default()
            };
            for handler in handlers {
                handler.handle(&event);
            }
        }
    }

    /// Run one dispatcher tick: high, then normal, then low priority,
    /// draining up to 15/10/5 events respectively (spec.md §4.1).
    pub async fn tick(&self) {
        self.drain(&self.queues.high, HIGH_PRIO_BUDGET).await;
        self.drain(&self.queues.normal, NORMAL_PRIO_BUDGET).await;
        self.drain(&self.queues.low, LOW_PRIO_BUDGET).await;
    }

    /// Spawn the periodic dispatcher task (default 100ms). Returns a
    /// handle that, when dropped or aborted, stops dispatching.
    pub fn spawn_dispatcher(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(DISPATCH_PERIOD);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fifo_within_one_priority() {
        let bus = EventBus::new();
        let seen: Arc<std::sync::Mutex<Vec<i64>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.subscribe(
            "PURCHASE_FINISHED",
            Arc::new(move |e: &Event| {
                if let EventKind::PurchaseFinished { cart_id } = e.kind() {
                    seen2.lock().unwrap().push(cart_id.0);
                }
            }),
        )
        .await;
        for i in 0..3 {
            bus.post(Event::purchase_finished(i)).await;
        }
        bus.tick().await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn high_before_normal_before_low_in_one_tick() {
        let bus = EventBus::new();
        let order: Arc<std::sync::Mutex<Vec<&'static str>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));

        for (kind, queue_name) in [
            ("STARTUP_COMPLETE", "high"),
            ("PLANOGRAM_IS_UP_TO_DATE", "normal"),
            ("BRAND_INFO_UPDATED", "low"),
        ] {
            let order = order.clone();
            bus.subscribe(
                kind,
                Arc::new(move |_: &Event| {
                    order.lock().unwrap().push(queue_name);
                }),
            )
            .await;
        }

        bus.post_low(Event::new(EventKind::BrandInfoUpdated)).await;
        bus.post(Event::new(EventKind::PlanogramIsUpToDate)).await;
        bus.post_high(Event::new(EventKind::StartupComplete)).await;

        bus.tick().await;
        assert_eq!(*order.lock().unwrap(), vec!["high", "normal", "low"]);
    }

    #[tokio::test]
    async fn budget_caps_events_drained_per_tick() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe(
            "BRAND_INFO_UPDATED",
            Arc::new(move |_: &Event| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;
        for _ in 0..(LOW_PRIO_BUDGET + 3) {
            bus.post_low(Event::new(EventKind::BrandInfoUpdated)).await;
        }
        bus.tick().await;
        assert_eq!(count.load(Ordering::SeqCst), LOW_PRIO_BUDGET);
        assert_eq!(bus.metrics().await.low, 3);
    }
}
