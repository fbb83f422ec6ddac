//! The host dispatcher
//!
//! All work in the host runs on one [`Dispatcher`]: event callbacks, completion callbacks, and
//! tasks scheduled for a later deadline. The dispatcher is a plain queue plus a deadline ordered
//! timer heap; nothing here blocks and nothing here is `Send`.
//!
//! # Time
//! The dispatcher keeps its own monotonic clock. The clock only moves when [`advance`] is called,
//! which makes every timeout in the host steppable: tests advance the clock directly, while a
//! host binding advances it by however much wall time elapsed between polls (see the facade
//! crate's pump). [`next_deadline`] tells an external pump how long it may sleep.
//!
//! # Re-entrance
//! Tasks are run with no internal borrow held, so a running task is free to post more work,
//! schedule timers, or cancel them.
//!
//! [`advance`]: Dispatcher::advance
//! [`next_deadline`]: Dispatcher::next_deadline

use alloc::boxed::Box;
use alloc::collections::{BTreeSet, BinaryHeap, VecDeque};
use alloc::rc::Rc;
use core::cell::RefCell;
use core::cmp::{Ordering, Reverse};
use core::time::Duration;

type Task = Box<dyn FnOnce() + 'static>;

/// Identifier of a scheduled task
///
/// Returned by [`Dispatcher::post_after`] for use with [`Dispatcher::cancel`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct TaskId(u64);

struct TimerEntry {
    deadline: Duration,
    sequence: u64,
    task: Task,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // sequence breaks deadline ties so that equal deadlines fire in schedule order
        self.deadline
            .cmp(&other.deadline)
            .then(self.sequence.cmp(&other.sequence))
    }
}

struct Inner {
    ready: VecDeque<Task>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    pending: BTreeSet<u64>,
    now: Duration,
    next_sequence: u64,
}

/// The single threaded task dispatcher
///
/// Cloning a `Dispatcher` is cheap and every clone posts into the same queue.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<RefCell<Inner>>,
}

impl Dispatcher {
    /// Create a new `Dispatcher`
    ///
    /// The clock starts at zero and only moves via [`advance`](Dispatcher::advance).
    pub fn new() -> Self {
        Dispatcher {
            inner: Rc::new(RefCell::new(Inner {
                ready: VecDeque::new(),
                timers: BinaryHeap::new(),
                pending: BTreeSet::new(),
                now: Duration::ZERO,
                next_sequence: 0,
            })),
        }
    }

    /// Get the current value of the dispatcher clock
    pub fn now(&self) -> Duration {
        self.inner.borrow().now
    }

    /// Queue `task` to run on the next turn of the dispatcher
    pub fn post(&self, task: impl FnOnce() + 'static) {
        self.inner.borrow_mut().ready.push_back(Box::new(task));
    }

    /// Schedule `task` to run once `delay` has elapsed on the dispatcher clock
    ///
    /// The returned [`TaskId`] cancels the task via [`cancel`](Dispatcher::cancel).
    pub fn post_after(&self, delay: Duration, task: impl FnOnce() + 'static) -> TaskId {
        let mut inner = self.inner.borrow_mut();

        let sequence = inner.next_sequence;

        inner.next_sequence += 1;

        let deadline = inner.now + delay;

        inner.pending.insert(sequence);

        inner.timers.push(Reverse(TimerEntry {
            deadline,
            sequence,
            task: Box::new(task),
        }));

        TaskId(sequence)
    }

    /// Cancel a task scheduled with [`post_after`](Dispatcher::post_after)
    ///
    /// Returns true when the task had not yet run.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.inner.borrow_mut().pending.remove(&id.0)
    }

    /// Run queued tasks and due timers until there is nothing left to do
    ///
    /// Returns the number of tasks that ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;

        while let Some(task) = self.take_runnable() {
            task();

            ran += 1;
        }

        ran
    }

    /// Move the clock forward by `duration` and run everything that became due
    pub fn advance(&self, duration: Duration) {
        {
            let mut inner = self.inner.borrow_mut();

            inner.now += duration;
        }

        self.run_until_idle();
    }

    /// Get the deadline of the earliest live timer
    ///
    /// This is for an external pump deciding how long it may sleep. `None` means no timer is
    /// scheduled.
    pub fn next_deadline(&self) -> Option<Duration> {
        let mut inner = self.inner.borrow_mut();

        // dead entries at the top of the heap are discardable
        while let Some(Reverse(entry)) = inner.timers.peek() {
            if inner.pending.contains(&entry.sequence) {
                return Some(entry.deadline);
            }

            inner.timers.pop();
        }

        None
    }

    fn take_runnable(&self) -> Option<Task> {
        let mut inner = self.inner.borrow_mut();

        if let Some(task) = inner.ready.pop_front() {
            return Some(task);
        }

        while let Some(Reverse(entry)) = inner.timers.peek() {
            if entry.deadline > inner.now {
                return None;
            }

            let Reverse(entry) = inner.timers.pop().unwrap();

            if inner.pending.remove(&entry.sequence) {
                return Some(entry.task);
            }
        }

        None
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    #[test]
    fn posted_tasks_run_in_order() {
        let dispatcher = Dispatcher::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for tag in 0..3 {
            let order = order.clone();

            dispatcher.post(move || order.borrow_mut().push(tag));
        }

        dispatcher.run_until_idle();

        assert_eq!(&[0, 1, 2], order.borrow().as_slice());
    }

    #[test]
    fn timers_fire_only_when_due() {
        let dispatcher = Dispatcher::new();
        let fired = Rc::new(RefCell::new(false));

        let flag = fired.clone();

        dispatcher.post_after(Duration::from_secs(5), move || *flag.borrow_mut() = true);

        dispatcher.run_until_idle();
        assert!(!*fired.borrow());

        dispatcher.advance(Duration::from_secs(4));
        assert!(!*fired.borrow());

        dispatcher.advance(Duration::from_secs(1));
        assert!(*fired.borrow());
    }

    #[test]
    fn canceled_timer_never_fires() {
        let dispatcher = Dispatcher::new();
        let fired = Rc::new(RefCell::new(false));

        let flag = fired.clone();

        let id = dispatcher.post_after(Duration::from_secs(1), move || *flag.borrow_mut() = true);

        assert!(dispatcher.cancel(id));
        assert!(!dispatcher.cancel(id));

        dispatcher.advance(Duration::from_secs(2));

        assert!(!*fired.borrow());
    }

    #[test]
    fn tasks_can_post_tasks() {
        let dispatcher = Dispatcher::new();
        let hits = Rc::new(RefCell::new(0));

        let inner_hits = hits.clone();
        let inner_dispatcher = dispatcher.clone();

        dispatcher.post(move || {
            let hits = inner_hits.clone();

            inner_dispatcher.post(move || *hits.borrow_mut() += 1);
        });

        dispatcher.run_until_idle();

        assert_eq!(1, *hits.borrow());
    }

    #[test]
    fn equal_deadlines_fire_in_schedule_order() {
        let dispatcher = Dispatcher::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for tag in 0..3 {
            let order = order.clone();

            dispatcher.post_after(Duration::from_secs(1), move || order.borrow_mut().push(tag));
        }

        dispatcher.advance(Duration::from_secs(1));

        assert_eq!(&[0, 1, 2], order.borrow().as_slice());
    }
}
