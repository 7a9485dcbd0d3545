//! Per-key ordering and in-flight accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// Resolves once a turn and every turn queued before it under the same key
/// have finished.
type Tail = Shared<BoxFuture<'static, ()>>;

struct Slot {
    generation: u64,
    tail: Tail,
}

#[derive(Default)]
struct GateState {
    next_generation: u64,
    tails: HashMap<String, Slot>,
}

/// Serial queue per key. Each task waits for the task enqueued before it under
/// the same key; keys are independent.
#[derive(Default)]
pub(crate) struct OrderingGate {
    state: Mutex<GateState>,
}

impl OrderingGate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Takes the next place in `key`'s queue. Queue order is call order.
    pub(crate) fn enqueue(self: &Arc<Self>, key: &str) -> Turn {
        let (done, rx) = oneshot::channel::<()>();
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        let previous = state.tails.get(key).map(|slot| slot.tail.clone());
        // The sender is only ever dropped, so `rx` always resolves to `Canceled`.
        let tail = match previous.clone() {
            Some(previous) => async move {
                previous.await;
                let _ = rx.await;
            }
            .boxed()
            .shared(),
            None => async move {
                let _ = rx.await;
            }
            .boxed()
            .shared(),
        };
        state
            .tails
            .insert(key.to_string(), Slot { generation, tail });
        Turn {
            gate: self.clone(),
            key: key.to_string(),
            generation,
            previous,
            _done: done,
        }
    }

    pub(crate) fn queued_keys(&self) -> usize {
        self.lock().tails.len()
    }
}

/// A place in a key's queue. Dropping it, on success, error or cancellation,
/// releases the next task once every earlier task has finished too, so a turn
/// dropped while still queued never lets its successor overtake.
pub(crate) struct Turn {
    gate: Arc<OrderingGate>,
    key: String,
    generation: u64,
    previous: Option<Tail>,
    _done: oneshot::Sender<()>,
}

impl Turn {
    /// Resolves once every earlier task for this key has finished.
    pub(crate) async fn wait(&mut self) {
        if let Some(previous) = self.previous.take() {
            previous.await;
        }
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        let is_tail = state
            .tails
            .get(&self.key)
            .map_or(false, |slot| slot.generation == self.generation);
        if is_tail {
            state.tails.remove(&self.key);
        }
    }
}

#[derive(Clone, Copy)]
enum Counter {
    Pending,
    InFlight,
}

/// Counts admitted updates (`pending`) and those holding a processing slot
/// (`in_flight`), and wakes waiters when both reach zero.
#[derive(Default)]
pub(crate) struct Tracker {
    pending: AtomicUsize,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Tracker {
    fn counter(&self, counter: Counter) -> &AtomicUsize {
        match counter {
            Counter::Pending => &self.pending,
            Counter::InFlight => &self.in_flight,
        }
    }

    fn track(self: &Arc<Self>, counter: Counter) -> TrackerGuard {
        self.counter(counter).fetch_add(1, Ordering::SeqCst);
        TrackerGuard {
            tracker: self.clone(),
            counter,
        }
    }

    pub(crate) fn pending_guard(self: &Arc<Self>) -> TrackerGuard {
        self.track(Counter::Pending)
    }

    pub(crate) fn in_flight_guard(self: &Arc<Self>) -> TrackerGuard {
        self.track(Counter::InFlight)
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn is_idle(&self) -> bool {
        self.pending() == 0 && self.in_flight() == 0
    }

    /// Waits until nothing is pending or in flight. Returns false if `deadline`
    /// passes first.
    pub(crate) async fn wait_idle(&self, deadline: Option<Instant>) -> bool {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if timeout_at(deadline, notified).await.is_err() {
                        return self.is_idle();
                    }
                }
                None => notified.await,
            }
        }
    }
}

pub(crate) struct TrackerGuard {
    tracker: Arc<Tracker>,
    counter: Counter,
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        self.tracker
            .counter(self.counter)
            .fetch_sub(1, Ordering::SeqCst);
        if self.tracker.is_idle() {
            self.tracker.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_waits_for_predecessor() {
        let gate = Arc::new(OrderingGate::default());
        let first = gate.enqueue("k");
        let mut second = gate.enqueue("k");

        let waiter = tokio::spawn(async move {
            second.wait().await;
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
        assert_eq!(gate.queued_keys(), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_keeps_chain() {
        let gate = Arc::new(OrderingGate::default());
        let first = gate.enqueue("k");
        let second = gate.enqueue("k");
        let mut third = gate.enqueue("k");

        drop(second);
        let waiter = tokio::spawn(async move {
            third.wait().await;
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
        assert_eq!(gate.queued_keys(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_wait() {
        let gate = Arc::new(OrderingGate::default());
        let _a = gate.enqueue("a");
        let mut b = gate.enqueue("b");
        tokio::time::timeout(Duration::from_millis(50), b.wait())
            .await
            .unwrap();
        assert_eq!(gate.queued_keys(), 2);
    }

    #[tokio::test]
    async fn test_tail_survives_earlier_drop() {
        let gate = Arc::new(OrderingGate::default());
        let first = gate.enqueue("k");
        let second = gate.enqueue("k");
        drop(first);
        assert_eq!(gate.queued_keys(), 1);
        drop(second);
        assert_eq!(gate.queued_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle() {
        let tracker = Arc::new(Tracker::default());
        assert!(tracker.wait_idle(None).await);

        let guard = tracker.in_flight_guard();
        let deadline = Instant::now() + Duration::from_millis(100);
        assert!(!tracker.wait_idle(Some(deadline)).await);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle(None).await })
        };
        tokio::task::yield_now().await;
        drop(guard);
        assert!(waiter.await.unwrap());
        assert_eq!(tracker.in_flight(), 0);
    }
}
