/// Admission Controller - bounded concurrency for sandboxed jobs
///
/// **Responsibility:**
/// Cap how many jobs hold a sandbox slot at once, queue everybody else in
/// strict arrival order, and hand out sandbox box ids.
///
/// **Protocol (per job id):**
/// 1. `acquire_or_wait` - returns `Immediate` if a slot is free, otherwise
///    queues the job and returns a ticket that resolves once a slot has been
///    handed to it
/// 2. `allocate` - consumes the slot (must follow step 1 without an await in
///    between when the answer was `Immediate`)
/// 3. `release` - returns the slot and wakes the earliest waiter
///
/// A woken waiter is *granted* the freed slot: the slot stays reserved for it
/// until it calls `allocate`, so a job arriving in the meantime cannot take
/// it first.
///
/// All state sits behind one mutex that is never held across an await.
use crate::metrics::Metrics;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Box ids wrap at this value
pub const BOX_ID_MODULUS: u32 = 999;

/// Outcome of [`AdmissionController::acquire_or_wait`]
#[derive(Debug)]
pub enum Admission {
    /// A slot is free; call `allocate` right away
    Immediate,
    /// Queued; resolves when a slot has been granted
    Pending(oneshot::Receiver<()>),
}

struct Waiter {
    job_id: Uuid,
    wake: oneshot::Sender<()>,
}

struct QueueTimer {
    language: String,
    version: String,
    started: Instant,
}

struct State {
    remaining: usize,
    queue: VecDeque<Waiter>,
    active: HashSet<Uuid>,
    /// Woken waiters whose slot is reserved until they allocate
    granted: HashSet<Uuid>,
    queue_timers: HashMap<Uuid, QueueTimer>,
    box_counter: u32,
    boxes_in_use: HashSet<u32>,
}

impl State {
    /// Slots neither held nor reserved for a woken waiter
    fn free(&self) -> usize {
        self.remaining - self.granted.len()
    }

    fn wake_next(&mut self) {
        while self.free() > 0 {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            if waiter.wake.send(()).is_ok() {
                self.granted.insert(waiter.job_id);
            } else {
                // The waiting task went away before it was served.
                debug!(job_id = %waiter.job_id, "Dropping abandoned queue entry");
                self.queue_timers.remove(&waiter.job_id);
            }
        }
    }
}

pub struct AdmissionController {
    capacity: usize,
    state: Mutex<State>,
    metrics: Arc<Metrics>,
}

impl AdmissionController {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        // A compiled job may hold two boxes until cleanup.
        if capacity.saturating_mul(2) >= BOX_ID_MODULUS as usize {
            warn!(
                capacity,
                modulus = BOX_ID_MODULUS,
                "Capacity is close to the number of box ids; jobs may fail with exhausted box ids"
            );
        }

        let controller = Self {
            capacity,
            state: Mutex::new(State {
                remaining: capacity,
                queue: VecDeque::new(),
                active: HashSet::new(),
                granted: HashSet::new(),
                queue_timers: HashMap::new(),
                box_counter: 0,
                boxes_in_use: HashSet::new(),
            }),
            metrics,
        };
        controller.publish(&controller.lock());
        controller
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // No code path panics while holding the lock, but stay usable if one ever does.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &State) {
        self.metrics
            .set_slots(state.queue.len(), state.active.len(), state.remaining);
        self.metrics.boxes_in_use.set(state.boxes_in_use.len() as i64);
    }

    pub fn acquire_or_wait(&self, job_id: Uuid, language: &str, version: &str) -> Admission {
        let mut state = self.lock();
        if state.free() > 0 {
            return Admission::Immediate;
        }

        let (wake, ticket) = oneshot::channel();
        state.queue.push_back(Waiter { job_id, wake });
        state.queue_timers.insert(
            job_id,
            QueueTimer {
                language: language.to_string(),
                version: version.to_string(),
                started: Instant::now(),
            },
        );
        self.publish(&state);
        Admission::Pending(ticket)
    }

    /// Take a slot for `job_id`. Returns `false` when no slot is available
    /// to this job.
    pub fn allocate(&self, job_id: Uuid) -> bool {
        let mut state = self.lock();
        let granted = state.granted.remove(&job_id);
        if !granted && state.free() == 0 {
            return false;
        }

        state.remaining -= 1;
        state.active.insert(job_id);
        if let Some(timer) = state.queue_timers.remove(&job_id) {
            self.metrics
                .observe_queue_wait(&timer.language, &timer.version, timer.started.elapsed());
        }
        self.publish(&state);
        true
    }

    /// Return the slot held by `job_id` and wake the earliest waiter.
    /// Returns `false` (and changes nothing) if the job holds no slot.
    pub fn release(&self, job_id: Uuid) -> bool {
        let mut state = self.lock();
        if !state.active.remove(&job_id) {
            return false;
        }
        state.remaining += 1;
        state.wake_next();
        self.publish(&state);
        true
    }

    /// Forget a job that never got to use its place in line. A grant that was
    /// already handed to it moves on to the next waiter.
    pub fn cancel_queued(&self, job_id: Uuid) {
        let mut state = self.lock();
        state.queue.retain(|waiter| waiter.job_id != job_id);
        state.queue_timers.remove(&job_id);
        if state.granted.remove(&job_id) {
            state.wake_next();
        }
        self.publish(&state);
    }

    /// Next box id in `[0, BOX_ID_MODULUS)`, skipping ids still in use.
    pub fn next_box_id(&self) -> Option<u32> {
        let mut state = self.lock();
        for _ in 0..BOX_ID_MODULUS {
            state.box_counter = (state.box_counter + 1) % BOX_ID_MODULUS;
            let id = state.box_counter;
            if state.boxes_in_use.insert(id) {
                self.publish(&state);
                return Some(id);
            }
        }
        None
    }

    pub fn release_box_id(&self, box_id: u32) {
        let mut state = self.lock();
        state.boxes_in_use.remove(&box_id);
        self.publish(&state);
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.lock();
        AdmissionSnapshot {
            remaining: state.remaining,
            active: state.active.len(),
            queued: state.queue.iter().map(|w| w.job_id).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub remaining: usize,
    pub active: usize,
    pub queued: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(capacity: usize) -> AdmissionController {
        AdmissionController::new(capacity, Arc::new(Metrics::new().unwrap()))
    }

    fn pending(admission: Admission) -> oneshot::Receiver<()> {
        match admission {
            Admission::Pending(ticket) => ticket,
            Admission::Immediate => panic!("expected to be queued"),
        }
    }

    fn assert_balanced(ctl: &AdmissionController) {
        let snap = ctl.snapshot();
        assert_eq!(snap.remaining + snap.active, ctl.capacity());
    }

    #[test]
    fn test_immediate_when_slot_free() {
        let ctl = controller(2);
        let job = Uuid::new_v4();
        assert!(matches!(ctl.acquire_or_wait(job, "python", "3"), Admission::Immediate));
        assert!(ctl.allocate(job));
        assert_eq!(ctl.snapshot().remaining, 1);
        assert_balanced(&ctl);
    }

    #[test]
    fn test_allocate_fails_without_free_slot() {
        let ctl = controller(1);
        assert!(ctl.allocate(Uuid::new_v4()));
        assert!(!ctl.allocate(Uuid::new_v4()));
        assert_balanced(&ctl);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_arrival_order() {
        let ctl = controller(1);
        let holder = Uuid::new_v4();
        assert!(matches!(ctl.acquire_or_wait(holder, "c", "10"), Admission::Immediate));
        assert!(ctl.allocate(holder));

        let waiters: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let mut tickets: Vec<_> = waiters
            .iter()
            .map(|id| pending(ctl.acquire_or_wait(*id, "c", "10")))
            .collect();
        assert_eq!(ctl.snapshot().queued, waiters);

        let mut current = holder;
        for (idx, id) in waiters.iter().enumerate() {
            assert!(ctl.release(current));
            // Exactly the head was woken.
            assert!(tickets[idx].try_recv().is_ok());
            for later in tickets.iter_mut().skip(idx + 1) {
                assert!(later.try_recv().is_err());
            }
            assert!(ctl.allocate(*id));
            assert!(ctl.snapshot().active <= 1);
            assert_balanced(&ctl);
            current = *id;
        }
        assert!(ctl.release(current));
        assert_eq!(ctl.snapshot().remaining, 1);
    }

    #[test]
    fn test_granted_slot_cannot_be_stolen() {
        let ctl = controller(1);
        let holder = Uuid::new_v4();
        let waiter = Uuid::new_v4();
        assert!(ctl.allocate(holder));
        let mut ticket = pending(ctl.acquire_or_wait(waiter, "go", "1.22"));

        assert!(ctl.release(holder));
        assert!(ticket.try_recv().is_ok());

        // A newcomer arriving before the woken waiter allocates must queue.
        let newcomer = Uuid::new_v4();
        let _late = pending(ctl.acquire_or_wait(newcomer, "go", "1.22"));
        assert!(!ctl.allocate(newcomer));
        assert!(ctl.allocate(waiter));
        assert_balanced(&ctl);
    }

    #[test]
    fn test_release_without_slot_is_noop() {
        let ctl = controller(2);
        assert!(!ctl.release(Uuid::new_v4()));
        assert_eq!(ctl.snapshot().remaining, 2);
        assert_balanced(&ctl);
    }

    #[test]
    fn test_cancel_queued_keeps_other_waiters() {
        let ctl = controller(1);
        let holder = Uuid::new_v4();
        assert!(ctl.allocate(holder));

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let _first_ticket = pending(ctl.acquire_or_wait(first, "rust", "1.80"));
        let mut second_ticket = pending(ctl.acquire_or_wait(second, "rust", "1.80"));

        ctl.cancel_queued(first);
        assert_eq!(ctl.snapshot().queued, vec![second]);

        assert!(ctl.release(holder));
        assert!(second_ticket.try_recv().is_ok());
        assert!(ctl.allocate(second));
        assert_balanced(&ctl);
    }

    #[test]
    fn test_cancel_after_grant_passes_slot_on() {
        let ctl = controller(1);
        let holder = Uuid::new_v4();
        assert!(ctl.allocate(holder));
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let _first_ticket = pending(ctl.acquire_or_wait(first, "rust", "1.80"));
        let mut second_ticket = pending(ctl.acquire_or_wait(second, "rust", "1.80"));

        assert!(ctl.release(holder));
        ctl.cancel_queued(first);

        assert!(second_ticket.try_recv().is_ok());
        assert!(ctl.allocate(second));
        assert_balanced(&ctl);
    }

    #[test]
    fn test_dropped_waiter_is_skipped() {
        let ctl = controller(1);
        let holder = Uuid::new_v4();
        assert!(ctl.allocate(holder));
        let gone = Uuid::new_v4();
        let next = Uuid::new_v4();
        drop(pending(ctl.acquire_or_wait(gone, "lua", "5.4")));
        let mut ticket = pending(ctl.acquire_or_wait(next, "lua", "5.4"));

        assert!(ctl.release(holder));
        assert!(ticket.try_recv().is_ok());
        assert!(ctl.snapshot().queued.is_empty());
    }

    #[test]
    fn test_cancel_unknown_job_is_noop() {
        let ctl = controller(1);
        ctl.cancel_queued(Uuid::new_v4());
        assert_eq!(ctl.snapshot().remaining, 1);
    }

    #[test]
    fn test_box_ids_wrap_and_skip_ids_in_use() {
        let ctl = controller(1);
        assert_eq!(ctl.next_box_id(), Some(1));
        assert_eq!(ctl.next_box_id(), Some(2));
        ctl.release_box_id(1);
        ctl.release_box_id(2);

        for _ in 3..BOX_ID_MODULUS {
            let id = ctl.next_box_id().unwrap();
            ctl.release_box_id(id);
        }
        // Wrapped around to zero.
        assert_eq!(ctl.next_box_id(), Some(0));
        // 1 is free again, but 0 is still held.
        assert_eq!(ctl.next_box_id(), Some(1));
    }

    #[test]
    fn test_box_ids_exhausted() {
        let ctl = controller(1);
        for _ in 0..BOX_ID_MODULUS {
            assert!(ctl.next_box_id().is_some());
        }
        assert_eq!(ctl.next_box_id(), None);
        ctl.release_box_id(500);
        assert_eq!(ctl.next_box_id(), Some(500));
    }
}
