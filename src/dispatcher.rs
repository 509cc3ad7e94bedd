//! The event dispatcher (§4.D): a timer queue and a ready queue serviced by
//! one caller at a time, handing work off to worker threads.

use crate::slab::{Slab, SlabKey};
use crate::sync::MprMutex;
use crate::time::now;
use crate::worker::{StartOutcome, WorkerPool, WorkerPriority};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

pub type EventId = SlabKey;

/// Whether an event re-arms itself after firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    OneShot,
    Continuous(Duration),
}

/// Scheduling priority (§3, §4.D): only consulted as a tie-break between
/// events with an identical due time — it never lets a lower-priority event
/// that is already due jump ahead of an earlier-due higher-priority one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Where an event's callback runs (§3's `thread` flag, §4.D's dispatch
/// step): inline on whichever thread calls [`Dispatcher::service`], or
/// handed to a [`WorkerPool`] — falling back to inline if the pool has no
/// worker available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Inline,
    Worker,
}

type Callback = Box<dyn FnMut() + Send>;

/// Shared so a worker-dispatched event can run its callback on another
/// thread without the slab ever losing ownership (unlike the inline-only
/// take-then-restore dance a plain `Box` would need).
type SharedCallback = std::sync::Arc<MprMutex<Callback>>;

struct EventSlot {
    callback: SharedCallback,
    recurrence: Recurrence,
    due: Instant,
    priority: Priority,
    dispatch: Dispatch,
    seq: u64,
    cancelled: bool,
}

/// Orders timer entries by due time, then by priority (higher first), then
/// by insertion sequence so that events tied on both fire in the order they
/// were scheduled (§4.D: "ties break by priority, then by insertion order").
struct TimerEntry {
    due: Instant,
    priority: Priority,
    seq: u64,
    id: EventId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse the due-time and priority
        // comparisons so the earliest due time sorts highest, higher
        // priority breaks a due-time tie, and the lower (earlier) sequence
        // number breaks a priority tie.
        other
            .due
            .cmp(&self.due)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Schedules and services timed and ready-to-run events. Not `Sync` on its
/// own internal sequence counter's ordering guarantees beyond what
/// [`MprMutex`] already provides, but safe to share behind an `Arc`.
pub struct Dispatcher {
    events: MprMutex<Slab<EventSlot>>,
    timers: MprMutex<BinaryHeap<TimerEntry>>,
    ready: MprMutex<Vec<EventId>>,
    next_seq: MprMutex<u64>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            events: MprMutex::new(Slab::new()),
            timers: MprMutex::new(BinaryHeap::new()),
            ready: MprMutex::new(Vec::new()),
            next_seq: MprMutex::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.lock().map(|n| {
            let v = *n;
            *n += 1;
            v
        })
    }

    /// Schedules `callback` to run after `delay` at [`Priority::Normal`],
    /// inline on the servicing thread. See [`Self::schedule_full`] for the
    /// full contract.
    pub fn schedule(
        &self,
        delay: Duration,
        recurrence: Recurrence,
        callback: impl FnMut() + Send + 'static,
    ) -> EventId {
        self.schedule_full(delay, recurrence, Priority::Normal, Dispatch::Inline, callback)
    }

    /// Schedules `callback` to run after `delay` at `priority`, inline on
    /// the servicing thread. See [`Self::schedule_full`] for the full
    /// contract.
    pub fn schedule_with_priority(
        &self,
        delay: Duration,
        recurrence: Recurrence,
        priority: Priority,
        callback: impl FnMut() + Send + 'static,
    ) -> EventId {
        self.schedule_full(delay, recurrence, priority, Dispatch::Inline, callback)
    }

    /// Schedules `callback` to run after `delay`. A [`Recurrence::Continuous`]
    /// event re-queues itself for its next due time before the callback
    /// runs, so a slow handler cannot starve its own cadence (§4.D). Ties at
    /// an identical due time are broken by `priority`, then by scheduling
    /// order. `dispatch` selects whether [`Dispatcher::service`] runs the
    /// callback inline or hands it to a worker pool.
    pub fn schedule_full(
        &self,
        delay: Duration,
        recurrence: Recurrence,
        priority: Priority,
        dispatch: Dispatch,
        callback: impl FnMut() + Send + 'static,
    ) -> EventId {
        let seq = self.next_seq();
        let due = now() + delay;
        let callback: SharedCallback = std::sync::Arc::new(MprMutex::new(Box::new(callback)));
        let id = self.events.lock().map(|slab| {
            slab.insert(EventSlot { callback, recurrence, due, priority, dispatch, seq, cancelled: false })
        });
        self.timers.lock().map(|heap| heap.push(TimerEntry { due, priority, seq, id }));
        id
    }

    /// Marks `id` as runnable immediately, bypassing the timer queue.
    pub fn post(&self, id: EventId) {
        self.ready.lock().map(|q| q.push(id));
    }

    pub fn remove(&self, id: EventId) {
        self.events.lock().map(|slab| {
            if let Some(slot) = slab.get_mut(id) {
                slot.cancelled = true;
            }
        });
    }

    /// Moves any timers whose due time has passed into the ready queue.
    fn promote_due_timers(&self) {
        let current = now();
        loop {
            let due = self.timers.lock().map(|heap| heap.peek().map(|e| e.due));
            match due {
                Some(due) if due <= current => {
                    let entry = self.timers.lock().map(|heap| heap.pop());
                    if let Some(entry) = entry {
                        self.ready.lock().map(|q| q.push(entry.id));
                    }
                }
                _ => break,
            }
        }
    }

    /// Time until the next timer is due, or `None` if there are none pending.
    pub fn next_deadline(&self) -> Option<Duration> {
        let due = self.timers.lock().map(|heap| heap.peek().map(|e| e.due))?;
        Some(due.saturating_duration_since(now()))
    }

    /// Runs every currently-ready event once, inline on the calling thread
    /// regardless of an event's `dispatch` flag — equivalent to calling
    /// [`Self::service_with_workers`] with no pool available. Continuous
    /// events are re-scheduled before their callback executes. Returns how
    /// many ran.
    pub fn service(&self) -> usize {
        self.service_with_workers(None)
    }

    /// Runs every currently-ready event once. A [`Dispatch::Worker`] event
    /// is handed off to `pool`; if `pool` is `None` or has no worker
    /// available, it falls back to running inline on the calling thread
    /// (§4.D: "dispatch via worker pool, falls through to inline execution
    /// if no worker available"). Continuous events are re-scheduled before
    /// their callback executes. Returns how many ran (handed off counts as
    /// ran, since from here on the dispatcher's job is done).
    pub fn service_with_workers(&self, pool: Option<&WorkerPool>) -> usize {
        self.promote_due_timers();
        let batch = self.ready.lock().map(std::mem::take);
        let mut ran = 0;
        for id in batch {
            let taken = self.events.lock().map(|slab| {
                let slot = match slab.get_mut(id) {
                    Some(s) if !s.cancelled => s,
                    _ => return None,
                };
                Some((slot.callback.clone(), slot.recurrence, slot.priority, slot.dispatch))
            });
            let Some((callback, recurrence, priority, dispatch)) = taken else { continue };
            // A continuous event is re-armed for its next due time before its
            // callback runs, so a slow handler cannot suppress its own cadence.
            if let Recurrence::Continuous(period) = recurrence {
                let seq = self.next_seq();
                let due = now() + period;
                self.events.lock().map(|slab| {
                    if let Some(slot) = slab.get_mut(id) {
                        slot.due = due;
                        slot.seq = seq;
                    }
                });
                self.timers.lock().map(|heap| heap.push(TimerEntry { due, priority, seq, id }));
            }
            if recurrence == Recurrence::OneShot {
                self.events.lock().map(|slab| slab.remove(id));
            }

            let run_inline = |cb: &SharedCallback| cb.lock().map(|f| f());
            match (dispatch, pool) {
                (Dispatch::Worker, Some(pool)) => {
                    let job_callback = callback.clone();
                    match pool.start_worker(WorkerPriority::Normal, move || {
                        job_callback.lock().map(|f| f());
                    }) {
                        StartOutcome::Started => {}
                        StartOutcome::Busy => run_inline(&callback),
                    }
                }
                _ => run_inline(&callback),
            }
            ran += 1;
        }
        ran
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().map(|slab| slab.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{MprCondvar, WaitOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fifo_tie_break_for_equal_deadlines() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(MprMutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            dispatcher.schedule(Duration::ZERO, Recurrence::OneShot, move || {
                order.lock().map(|v| v.push(i));
            });
        }
        std::thread::sleep(Duration::from_millis(5));
        dispatcher.service();
        assert_eq!(order.lock().map(|v| v.clone()), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn priority_breaks_ties_at_equal_due_time_but_not_across_due_times() {
        // Mirrors the spec's dispatcher-ordering scenario: events due at
        // t+10 (NORMAL), t+10 (HIGH) and t+5 (NORMAL) must service in the
        // order t+5, t+10 (HIGH), t+10 (NORMAL) — an earlier due time always
        // wins even against a higher-priority later one.
        let dispatcher = Dispatcher::new();
        let order = Arc::new(MprMutex::new(Vec::new()));

        let o = order.clone();
        dispatcher.schedule_with_priority(Duration::from_millis(20), Recurrence::OneShot, Priority::Normal, move || {
            o.lock().map(|v| v.push("t+10 normal"));
        });
        let o = order.clone();
        dispatcher.schedule_with_priority(Duration::from_millis(20), Recurrence::OneShot, Priority::High, move || {
            o.lock().map(|v| v.push("t+10 high"));
        });
        let o = order.clone();
        dispatcher.schedule_with_priority(Duration::from_millis(10), Recurrence::OneShot, Priority::Normal, move || {
            o.lock().map(|v| v.push("t+5 normal"));
        });

        std::thread::sleep(Duration::from_millis(30));
        dispatcher.service();
        assert_eq!(order.lock().map(|v| v.clone()), vec!["t+5 normal", "t+10 high", "t+10 normal"]);
    }

    #[test]
    fn continuous_event_reschedules() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        dispatcher.schedule(Duration::ZERO, Recurrence::Continuous(Duration::from_millis(1)), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(3));
            dispatcher.service();
        }
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn worker_dispatch_runs_off_the_calling_thread() {
        use crate::worker::WorkerPool;

        let dispatcher = Dispatcher::new();
        let pool = WorkerPool::new(2, 1);
        let caller_thread = std::thread::current().id();
        let seen_thread: Arc<MprMutex<Option<std::thread::ThreadId>>> = Arc::new(MprMutex::new(None));
        let done = Arc::new(MprCondvar::new());

        let seen = seen_thread.clone();
        let d = done.clone();
        dispatcher.schedule_full(Duration::ZERO, Recurrence::OneShot, Priority::Normal, Dispatch::Worker, move || {
            seen.lock().map(|slot| *slot = Some(std::thread::current().id()));
            d.signal();
        });
        std::thread::sleep(Duration::from_millis(2));
        dispatcher.service_with_workers(Some(&pool));
        assert_eq!(done.wait(Duration::from_secs(1)), WaitOutcome::Signalled);
        assert_ne!(seen_thread.lock().map(|slot| *slot), Some(caller_thread));
    }

    #[test]
    fn worker_dispatch_falls_back_to_inline_with_no_pool() {
        let dispatcher = Dispatcher::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        dispatcher.schedule_full(Duration::ZERO, Recurrence::OneShot, Priority::Normal, Dispatch::Worker, move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(2));
        let count = dispatcher.service_with_workers(None);
        assert_eq!(count, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_event_does_not_run() {
        let dispatcher = Dispatcher::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let id = dispatcher.schedule(Duration::ZERO, Recurrence::OneShot, move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.remove(id);
        std::thread::sleep(Duration::from_millis(2));
        dispatcher.service();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
