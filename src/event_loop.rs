/// Single-threaded event loop backing timers, deferred I/O settles and
/// promise callbacks.
///
/// The interpreter owns the thread: while it runs, the loop is not polled.
/// Between interpreter runs the VM drains the ready queue (FIFO) and fires
/// due timers (earliest deadline first, FIFO among equal deadlines). When
/// nothing is ready but timers are pending, the loop parks on a
/// current-thread tokio runtime until the next deadline.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::value::{HeapId, Value};

/// Work items delivered back into the interpreter.
#[derive(Debug, Clone, Copy)]
pub enum LoopTask {
    /// A timer fired; the VM invokes its closure and reschedules repeating
    /// timers.
    Timer { timer: HeapId },
    /// Settle a promise with a value or an exception (deferred I/O).
    Settle {
        promise: HeapId,
        value: Value,
        reject: bool,
    },
}

#[derive(Debug)]
struct TimerEntry {
    deadline: Instant,
    /// FIFO tiebreak for equal deadlines.
    seq: u64,
    id: u64,
    timer: HeapId,
    interval_ms: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    /// Inverted so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct EventLoop {
    runtime: tokio::runtime::Runtime,
    timers: BinaryHeap<TimerEntry>,
    ready: VecDeque<LoopTask>,
    cancelled: HashSet<u64>,
    next_timer_id: u64,
    next_seq: u64,
}

impl EventLoop {
    pub fn new() -> std::io::Result<EventLoop> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        Ok(EventLoop {
            runtime,
            timers: BinaryHeap::new(),
            ready: VecDeque::new(),
            cancelled: HashSet::new(),
            next_timer_id: 1,
            next_seq: 0,
        })
    }

    pub fn enqueue(&mut self, task: LoopTask) {
        self.ready.push_back(task);
    }

    /// Registers a timer; returns the handle used for cancellation.
    pub fn schedule_timer(&mut self, timer: HeapId, delay_ms: u64, interval_ms: u64) -> u64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.push_timer_entry(id, timer, delay_ms, interval_ms);
        id
    }

    fn push_timer_entry(&mut self, id: u64, timer: HeapId, delay_ms: u64, interval_ms: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(TimerEntry {
            deadline: Instant::now() + Duration::from_millis(delay_ms),
            seq,
            id,
            timer,
            interval_ms,
        });
    }

    pub fn cancel_timer(&mut self, id: u64) {
        self.cancelled.insert(id);
    }

    pub fn has_pending_work(&self) -> bool {
        !self.ready.is_empty() || self.live_timer_pending()
    }

    fn live_timer_pending(&self) -> bool {
        self.timers.iter().any(|t| !self.cancelled.contains(&t.id))
    }

    /// Next task that is ready right now: queued work first, then due
    /// timers. Repeating timers are rescheduled as they fire.
    pub fn next_ready_task(&mut self) -> Option<LoopTask> {
        if let Some(task) = self.ready.pop_front() {
            return Some(task);
        }
        let now = Instant::now();
        while let Some(entry) = self.timers.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = match self.timers.pop() {
                Some(entry) => entry,
                None => break,
            };
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            if entry.interval_ms > 0 {
                self.push_timer_entry(entry.id, entry.timer, entry.interval_ms, entry.interval_ms);
            }
            return Some(LoopTask::Timer { timer: entry.timer });
        }
        None
    }

    /// Parks the thread until the earliest live timer is due. No-op when
    /// work is already queued or no timer is pending.
    pub fn wait_for_next_timer(&mut self) {
        if !self.ready.is_empty() {
            return;
        }
        // Discard cancelled heap heads so the wait targets a live timer.
        while let Some(entry) = self.timers.peek() {
            if self.cancelled.contains(&entry.id) {
                let id = entry.id;
                self.timers.pop();
                self.cancelled.remove(&id);
            } else {
                break;
            }
        }
        let Some(entry) = self.timers.peek() else { return };
        let deadline = entry.deadline;
        self.runtime.block_on(async move {
            tokio::time::sleep_until(deadline.into()).await;
        });
    }

    /// Heap references held by queued tasks and live timers; part of the GC
    /// root set.
    pub fn roots(&self, out: &mut Vec<HeapId>) {
        for task in &self.ready {
            match task {
                LoopTask::Timer { timer } => out.push(*timer),
                LoopTask::Settle { promise, value, .. } => {
                    out.push(*promise);
                    if let Value::Obj(id) = value {
                        out.push(*id);
                    }
                }
            }
        }
        for entry in &self.timers {
            out.push(entry.timer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_queue_is_fifo() {
        let mut event_loop = EventLoop::new().expect("loop builds");
        event_loop.enqueue(LoopTask::Timer { timer: HeapId(1) });
        event_loop.enqueue(LoopTask::Timer { timer: HeapId(2) });
        match event_loop.next_ready_task() {
            Some(LoopTask::Timer { timer }) => assert_eq!(timer, HeapId(1)),
            other => panic!("unexpected task {:?}", other),
        }
        match event_loop.next_ready_task() {
            Some(LoopTask::Timer { timer }) => assert_eq!(timer, HeapId(2)),
            other => panic!("unexpected task {:?}", other),
        }
        assert!(event_loop.next_ready_task().is_none());
    }

    #[test]
    fn test_due_timers_fire_in_deadline_order() {
        let mut event_loop = EventLoop::new().expect("loop builds");
        event_loop.schedule_timer(HeapId(10), 0, 0);
        event_loop.schedule_timer(HeapId(11), 0, 0);
        // Equal deadlines: FIFO by registration.
        std::thread::sleep(Duration::from_millis(2));
        match event_loop.next_ready_task() {
            Some(LoopTask::Timer { timer }) => assert_eq!(timer, HeapId(10)),
            other => panic!("unexpected task {:?}", other),
        }
        match event_loop.next_ready_task() {
            Some(LoopTask::Timer { timer }) => assert_eq!(timer, HeapId(11)),
            other => panic!("unexpected task {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_timers_never_fire() {
        let mut event_loop = EventLoop::new().expect("loop builds");
        let id = event_loop.schedule_timer(HeapId(7), 0, 0);
        event_loop.cancel_timer(id);
        std::thread::sleep(Duration::from_millis(2));
        assert!(event_loop.next_ready_task().is_none());
        assert!(!event_loop.has_pending_work());
    }

    #[test]
    fn test_repeating_timer_reschedules() {
        let mut event_loop = EventLoop::new().expect("loop builds");
        let id = event_loop.schedule_timer(HeapId(5), 0, 1);
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(
            event_loop.next_ready_task(),
            Some(LoopTask::Timer { .. })
        ));
        assert!(event_loop.has_pending_work(), "interval timer re-arms");
        event_loop.cancel_timer(id);
    }
}
