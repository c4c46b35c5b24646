//! Timer scheduling abstraction.
//!
//! The bridge never arms timers directly; tool-call deadlines, query
//! deadlines, and the session sweep all go through a [`Scheduler`]. Three
//! implementations are provided:
//!
//! - [`TokioScheduler`] - one task per timer, the default for hosts with a
//!   real timer wheel
//! - [`AlarmScheduler`] - a single-alarm implementation for hosts that only
//!   offer one programmable alarm; keeps a min-heap of fire-at instants and
//!   reprograms the alarm to the nearest
//! - [`NoopScheduler`] - accepts everything and fires nothing, for tests
//!   that drive time by hand

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Identifier of a scheduled timer, usable for cancellation.
pub type TimerId = u64;

/// One-shot callback.
pub type OneShotFn = Box<dyn FnOnce() + Send + 'static>;

/// Recurring callback.
pub type RecurringFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// Timer scheduling contract.
pub trait Scheduler: Send + Sync {
    /// Fire `f` once after `delay`.
    fn schedule(&self, delay: Duration, f: OneShotFn) -> TimerId;

    /// Cancel a pending one-shot if it has not fired.
    fn cancel(&self, id: TimerId);

    /// Fire `f` repeatedly with a minimum period.
    fn schedule_interval(&self, period: Duration, f: RecurringFn) -> TimerId;

    /// Stop a recurring timer.
    fn cancel_interval(&self, id: TimerId);

    /// Cancel all outstanding timers.
    fn dispose(&self);
}

// ---------------------------------------------------------------------------
// Tokio-backed scheduler
// ---------------------------------------------------------------------------

struct TokioInner {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<TimerId, AbortHandle>>,
    disposed: AtomicBool,
}

impl TokioInner {
    fn register(&self, id: TimerId, handle: AbortHandle) {
        let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
        if self.disposed.load(Ordering::SeqCst) {
            handle.abort();
        } else {
            tasks.insert(id, handle);
        }
    }

    fn remove(&self, id: TimerId) -> Option<AbortHandle> {
        self.tasks.lock().expect("scheduler lock poisoned").remove(&id)
    }
}

/// Timer-backed scheduler: each timer is its own tokio task.
#[derive(Clone)]
pub struct TokioScheduler {
    inner: Arc<TokioInner>,
}

impl TokioScheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokioInner {
                next_id: AtomicU64::new(1),
                tasks: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of live timers (for tests and monitoring).
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.tasks.lock().expect("scheduler lock poisoned").len()
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, f: OneShotFn) -> TimerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Remove first so a concurrent cancel after this point is a no-op.
            if inner.remove(id).is_some() {
                f();
            }
        })
        .abort_handle();
        self.inner.register(id, handle);
        id
    }

    fn cancel(&self, id: TimerId) {
        if let Some(handle) = self.inner.remove(id) {
            handle.abort();
        }
    }

    fn schedule_interval(&self, period: Duration, f: RecurringFn) -> TimerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                f();
            }
        })
        .abort_handle();
        self.inner.register(id, handle);
        id
    }

    fn cancel_interval(&self, id: TimerId) {
        self.cancel(id);
    }

    fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        let handles: Vec<AbortHandle> = {
            let mut tasks = self.inner.tasks.lock().expect("scheduler lock poisoned");
            tasks.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioScheduler").field("outstanding", &self.outstanding()).finish()
    }
}

// ---------------------------------------------------------------------------
// No-op scheduler
// ---------------------------------------------------------------------------

/// Scheduler that accepts everything and fires nothing.
#[derive(Debug, Default)]
pub struct NoopScheduler {
    next_id: AtomicU64,
}

impl NoopScheduler {
    /// Create a new no-op scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1) }
    }
}

impl Scheduler for NoopScheduler {
    fn schedule(&self, _delay: Duration, _f: OneShotFn) -> TimerId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn cancel(&self, _id: TimerId) {}

    fn schedule_interval(&self, _period: Duration, _f: RecurringFn) -> TimerId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn cancel_interval(&self, _id: TimerId) {}

    fn dispose(&self) {}
}

// ---------------------------------------------------------------------------
// Single-alarm scheduler
// ---------------------------------------------------------------------------

enum AlarmEntry {
    OneShot(Option<OneShotFn>),
    Interval { period: Duration, f: RecurringFn },
}

struct AlarmState {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, AlarmEntry>,
}

struct AlarmInner {
    next_id: AtomicU64,
    state: Mutex<AlarmState>,
    wake: Notify,
    disposed: AtomicBool,
    driver: Mutex<Option<AbortHandle>>,
}

impl AlarmInner {
    /// Pop everything due, collect callbacks to run outside the lock, and
    /// return the next deadline if any.
    fn drain_due(&self) -> (Vec<OneShotFn>, Option<Instant>) {
        let now = Instant::now();
        let mut due: Vec<OneShotFn> = Vec::new();
        let mut state = self.state.lock().expect("scheduler lock poisoned");

        while let Some(&Reverse((at, id))) = state.heap.peek() {
            if at > now {
                break;
            }
            state.heap.pop();
            match state.entries.get_mut(&id) {
                // Cancelled entries leave a stale heap slot behind
                None => {}
                Some(AlarmEntry::OneShot(f)) => {
                    if let Some(f) = f.take() {
                        due.push(f);
                    }
                    state.entries.remove(&id);
                }
                Some(AlarmEntry::Interval { period, f }) => {
                    let f = Arc::clone(f);
                    due.push(Box::new(move || f()));
                    let next = now + *period;
                    state.heap.push(Reverse((next, id)));
                }
            }
        }

        let next = state.heap.peek().map(|&Reverse((at, _))| at);
        (due, next)
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.disposed.load(Ordering::SeqCst) {
                return;
            }
            let (due, next) = self.drain_due();
            for f in due {
                f();
            }
            match next {
                Some(at) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(at) => {}
                        () = self.wake.notified() => {}
                    }
                }
                None => self.wake.notified().await,
            }
        }
    }
}

/// Single-alarm scheduler: all callbacks share one sleep.
///
/// Callbacks are stored with absolute fire-at instants; a driver task sleeps
/// until the nearest one, runs everything due, and reprograms itself.
/// Recurring callbacks reschedule relative to `now` on each firing.
#[derive(Clone)]
pub struct AlarmScheduler {
    inner: Arc<AlarmInner>,
}

impl AlarmScheduler {
    /// Create the scheduler and start its driver task.
    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(AlarmInner {
            next_id: AtomicU64::new(1),
            state: Mutex::new(AlarmState { heap: BinaryHeap::new(), entries: HashMap::new() }),
            wake: Notify::new(),
            disposed: AtomicBool::new(false),
            driver: Mutex::new(None),
        });

        let driver = Arc::clone(&inner);
        let handle = tokio::spawn(driver.run()).abort_handle();
        *inner.driver.lock().expect("scheduler lock poisoned") = Some(handle);

        Self { inner }
    }

    fn arm(&self, id: TimerId, at: Instant, entry: AlarmEntry) {
        {
            let mut state = self.inner.state.lock().expect("scheduler lock poisoned");
            state.entries.insert(id, entry);
            state.heap.push(Reverse((at, id)));
        }
        self.inner.wake.notify_one();
    }

    /// Number of live timers (for tests and monitoring).
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().expect("scheduler lock poisoned").entries.len()
    }
}

impl Scheduler for AlarmScheduler {
    fn schedule(&self, delay: Duration, f: OneShotFn) -> TimerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.arm(id, Instant::now() + delay, AlarmEntry::OneShot(Some(f)));
        id
    }

    fn cancel(&self, id: TimerId) {
        self.inner.state.lock().expect("scheduler lock poisoned").entries.remove(&id);
    }

    fn schedule_interval(&self, period: Duration, f: RecurringFn) -> TimerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.arm(id, Instant::now() + period, AlarmEntry::Interval { period, f });
        id
    }

    fn cancel_interval(&self, id: TimerId) {
        self.cancel(id);
    }

    fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        {
            let mut state = self.inner.state.lock().expect("scheduler lock poisoned");
            state.entries.clear();
            state.heap.clear();
        }
        self.inner.wake.notify_one();
        if let Some(handle) = self.inner.driver.lock().expect("scheduler lock poisoned").take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for AlarmScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmScheduler").field("outstanding", &self.outstanding()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_tokio_one_shot_fires() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        scheduler.schedule(Duration::from_millis(10), Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_tokio_cancel_prevents_firing() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let id = scheduler.schedule(Duration::from_millis(20), Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));
        scheduler.cancel(id);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_tokio_interval_repeats() {
        let scheduler = TokioScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let id = scheduler.schedule_interval(Duration::from_millis(10), Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(65)).await;
        scheduler.cancel_interval(id);
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected at least 3 ticks, saw {seen}");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen, "ticks after cancel");
    }

    #[tokio::test]
    async fn test_tokio_dispose_cancels_everything() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));

        for _ in 0..4 {
            let flag = Arc::clone(&fired);
            scheduler.schedule(Duration::from_millis(30), Box::new(move || {
                flag.store(true, Ordering::SeqCst);
            }));
        }
        scheduler.dispose();
        assert_eq!(scheduler.outstanding(), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_noop_never_fires() {
        let scheduler = NoopScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let a = scheduler.schedule(Duration::from_millis(1), Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));
        let b = scheduler.schedule_interval(Duration::from_millis(1), Arc::new(|| {}));
        assert_ne!(a, b);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_alarm_fires_in_order() {
        let scheduler = AlarmScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay, tag) in [(30u64, "late"), (10, "early")] {
            let order = Arc::clone(&order);
            scheduler.schedule(Duration::from_millis(delay), Box::new(move || {
                order.lock().unwrap().push(tag);
            }));
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
        scheduler.dispose();
    }

    #[tokio::test]
    async fn test_alarm_cancel_and_interval() {
        let scheduler = AlarmScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let count = Arc::new(AtomicUsize::new(0));

        let flag = Arc::clone(&fired);
        let cancelled = scheduler.schedule(Duration::from_millis(15), Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));
        scheduler.cancel(cancelled);

        let counter = Arc::clone(&count);
        let interval = scheduler.schedule_interval(Duration::from_millis(10), Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(65)).await;
        scheduler.cancel_interval(interval);

        assert!(!fired.load(Ordering::SeqCst));
        assert!(count.load(Ordering::SeqCst) >= 3);
        scheduler.dispose();
    }
}
