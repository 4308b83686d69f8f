//! Named timer queues.
//!
//! The source this crate is modeled on keeps four separate timer wheels
//! (default, B, C, D) purely so each class's population can be observed
//! independently; correctness never depends on which queue a given timer
//! lives in. Rather than a bespoke min-heap, each scheduled timer here is
//! a `tokio::time::sleep` task that posts a [`TimerFired`] command back to
//! the event-loop task on completion; canceling a timer aborts its task.
//! An abort racing a firing that already completed its send is harmless —
//! the event loop looks the branch up by id at fire time and no-ops if it
//! is gone, so a late-delivered `TimerFired` is simply discarded.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;

use crate::transaction::key::BranchKey;

/// Which named queue a timer belongs to. Carried only for the per-class
/// counters in [`TimerManager::class_counts`]; scheduling behavior is
/// identical across classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerClass {
    /// Timer A (retransmit) and Timer B (INVITE timeout).
    Default,
    /// Timer C (proxy INVITE timeout).
    C,
    /// Timer D (response retransmission wait).
    D,
    /// Reserved fourth class, mirrored from the source's four-queue
    /// partition; unused by any timer this crate currently schedules but
    /// kept so a future timer kind has somewhere semantically distinct to
    /// live without widening this enum's callers.
    Reserved,
}

/// Which specific RFC 3261 timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    A,
    B,
    C,
    D,
}

/// Command posted to the event loop when a scheduled timer elapses.
#[derive(Debug, Clone)]
pub struct TimerFired {
    pub branch: BranchKey,
    pub kind: TimerKind,
}

/// A single outstanding timer; dropping or calling [`TimerHandle::cancel`]
/// aborts the underlying task.
pub struct TimerHandle {
    class: TimerClass,
    join: JoinHandle<()>,
    counts: Arc<[AtomicUsize; 4]>,
    idx: usize,
    /// Shared with the spawned task: whichever of "the sleep completed"
    /// or "cancel() ran" gets here first performs the class-count
    /// decrement; the other is a no-op. Without this an abort racing a
    /// just-completed firing would decrement the same slot twice.
    decremented: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Cancel the timer. Idempotent: canceling a timer whose task has
    /// already fired (and whose command is already queued or processed)
    /// is a harmless no-op — the class counter was already brought down
    /// by the firing itself, and `decremented` stops this call from
    /// bringing it down a second time.
    pub fn cancel(self) {
        self.join.abort();
        if self.decremented.swap(true, Ordering::AcqRel) {
            return;
        }
        self.counts[self.idx].fetch_sub(1, Ordering::Relaxed);
    }

    pub fn class(&self) -> TimerClass {
        self.class
    }
}

/// Schedules and tracks outstanding timers, dispatching fired timers onto
/// the event loop's command channel.
#[derive(Clone)]
pub struct TimerManager {
    fired_tx: Sender<TimerFired>,
    counts: Arc<[AtomicUsize; 4]>,
}

impl TimerManager {
    pub fn new(fired_tx: Sender<TimerFired>) -> Self {
        TimerManager {
            fired_tx,
            counts: Arc::new([
                AtomicUsize::new(0),
                AtomicUsize::new(0),
                AtomicUsize::new(0),
                AtomicUsize::new(0),
            ]),
        }
    }

    fn class_index(class: TimerClass) -> usize {
        match class {
            TimerClass::Default => 0,
            TimerClass::C => 1,
            TimerClass::D => 2,
            TimerClass::Reserved => 3,
        }
    }

    /// Current population of each named queue, in `(default, c, d,
    /// reserved)` order. Observability only.
    pub fn class_counts(&self) -> [usize; 4] {
        [
            self.counts[0].load(Ordering::Relaxed),
            self.counts[1].load(Ordering::Relaxed),
            self.counts[2].load(Ordering::Relaxed),
            self.counts[3].load(Ordering::Relaxed),
        ]
    }

    /// Schedule a one-shot timer that fires after `delay`.
    pub fn schedule(
        &self,
        class: TimerClass,
        branch: BranchKey,
        kind: TimerKind,
        delay: Duration,
    ) -> TimerHandle {
        let idx = Self::class_index(class);
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        let fired_tx = self.fired_tx.clone();
        let counts = self.counts.clone();
        let decremented = Arc::new(AtomicBool::new(false));
        let task_decremented = decremented.clone();
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !task_decremented.swap(true, Ordering::AcqRel) {
                counts[idx].fetch_sub(1, Ordering::Relaxed);
            }
            let _ = fired_tx.send(TimerFired { branch, kind }).await;
        });
        TimerHandle {
            class,
            join,
            counts,
            idx,
            decremented,
        }
    }
}
