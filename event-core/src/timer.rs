//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Priority-aware min-heap of one-shot and periodic timers.
//!
//! Grounded on XORP's `libxorp` timer/heap machinery (there is no single
//! `timer_list.cc` in the surviving snapshot, but `eventloop.cc` shows the
//! contract this module must satisfy: `advance_time`, `get_next_delay`,
//! `get_expired_priority`, `run`). Stale heap entries (a timer cancelled or
//! rescheduled after being pushed) are detected with a per-slot generation
//! token rather than by re-sifting the heap, the standard trick for an
//! "indexed" binary heap in safe Rust.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use slab::Slab;

use crate::clock::TimeVal;

pub const PRIORITY_INFINITY: i32 = i32::MAX;

// Handle to a scheduled timer. Dropping it does *not* cancel the timer
// (the timer list owns the callback); call [`TimerList::cancel`]
// explicitly, mirroring XORP's `XorpTimer` value type semantics but without
// the implicit ref-counted auto-cancel, since in Rust the owner is
// expected to hold the handle explicitly for as long as the timer should
// remain live.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimerHandle {
    key: usize,
    token: u64,
}

enum Callback {
    OneOff(Option<Box<dyn FnOnce()>>),
    Periodic(Box<dyn FnMut() -> bool>),
    Flag(Arc<AtomicBool>),
}

struct Slot {
    token: u64,
    priority: i32,
    period: Option<TimeVal>,
    callback: Callback,
}

#[derive(Eq, PartialEq)]
struct HeapEntry {
    deadline: TimeVal,
    priority: i32,
    seq: u64,
    key: usize,
    token: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.priority, self.seq).cmp(&(
            other.deadline,
            other.priority,
            other.seq,
        ))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct TimerList {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    slots: Slab<Slot>,
    next_token: u64,
    next_seq: u64,
}

impl TimerList {
    pub fn new() -> TimerList {
        TimerList {
            heap: BinaryHeap::new(),
            slots: Slab::new(),
            next_token: 0,
            next_seq: 0,
        }
    }

    fn insert(
        &mut self,
        deadline: TimeVal,
        priority: i32,
        period: Option<TimeVal>,
        callback: Callback,
    ) -> TimerHandle {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let key = self.slots.insert(Slot { token, priority, period, callback });
        self.heap.push(Reverse(HeapEntry { deadline, priority, seq, key, token }));

        TimerHandle { key, token }
    }

    // Schedules a one-shot timer to fire `delay` from `now`.
    pub fn schedule_after(
        &mut self,
        now: TimeVal,
        delay: TimeVal,
        priority: i32,
        callback: impl FnOnce() + 'static,
    ) -> TimerHandle {
        self.schedule_at(now + delay, priority, callback)
    }

    // Schedules a one-shot timer to fire at an absolute deadline.
    pub fn schedule_at(
        &mut self,
        deadline: TimeVal,
        priority: i32,
        callback: impl FnOnce() + 'static,
    ) -> TimerHandle {
        self.insert(deadline, priority, None, Callback::OneOff(Some(Box::new(callback))))
    }

    // Schedules a periodic timer. The callback is invoked on every firing;
    // returning `false` stops further reinsertion (equivalent to
    // cancelling from within the callback).
    pub fn new_periodic(
        &mut self,
        now: TimeVal,
        period: TimeVal,
        priority: i32,
        callback: impl FnMut() -> bool + 'static,
    ) -> TimerHandle {
        self.insert(
            now + period,
            priority,
            Some(period),
            Callback::Periodic(Box::new(callback)),
        )
    }

    // Sets `flag` to `true` after `delay`. A cheap alternative to a full
    // callback timer for code that only needs to poll a boolean.
    pub fn set_flag_after(
        &mut self,
        now: TimeVal,
        delay: TimeVal,
        priority: i32,
        flag: Arc<AtomicBool>,
    ) -> TimerHandle {
        self.insert(now + delay, priority, None, Callback::Flag(flag))
    }

    // Cancels a timer. Idempotent: cancelling an already-fired or
    // already-cancelled handle is a harmless no-op.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if let Some(slot) = self.slots.get(handle.key)
            && slot.token == handle.token
        {
            self.slots.remove(handle.key);
        }
    }

    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        matches!(self.slots.get(handle.key), Some(slot) if slot.token == handle.token)
    }

    // Interval until the earliest live deadline, or `TimeVal::ZERO` if one
    // is already due.
    pub fn get_next_delay(&mut self, now: TimeVal) -> TimeVal {
        self.drop_stale();
        match self.heap.peek() {
            Some(Reverse(top)) => (top.deadline - now).non_negative(),
            None => TimeVal::MAXIMUM,
        }
    }

    // Priority of the most urgent expired timer, if any.
    pub fn get_expired_priority(&mut self, now: TimeVal) -> i32 {
        self.drop_stale();
        match self.heap.peek() {
            Some(Reverse(top)) if top.deadline <= now => top.priority,
            _ => PRIORITY_INFINITY,
        }
    }

    // Dispatches every timer whose deadline has passed. Periodic timers
    // that return `true` (or never return a bool, i.e. one-offs) are not
    // reinserted; periodic timers reinsert at `deadline + period` to avoid
    // drift from the actual firing time.
    pub fn run(&mut self, now: TimeVal) -> usize {
        let mut fired = 0;

        loop {
            let due = matches!(self.heap.peek(), Some(Reverse(top)) if top.deadline <= now);
            if !due {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();

            let Some(slot) = self.slots.get(entry.key) else {
                // Stale: cancelled since being pushed.
                continue;
            };
            if slot.token != entry.token {
                // Stale: slot was reused by a different timer.
                continue;
            }

            // Take ownership of the slot so callbacks may freely
            // reschedule or cancel other timers (including themselves)
            // without aliasing this one.
            let mut slot = self.slots.remove(entry.key);
            fired += 1;

            match slot.callback {
                Callback::OneOff(ref mut cb) => {
                    if let Some(cb) = cb.take() {
                        cb();
                    }
                }
                Callback::Periodic(ref mut cb) => {
                    let keep_going = cb();
                    if keep_going {
                        let period = slot.period.unwrap_or(TimeVal::ZERO);
                        let next_deadline = entry.deadline + period;
                        let token = self.next_token;
                        self.next_token = self.next_token.wrapping_add(1);
                        let seq = self.next_seq;
                        self.next_seq = self.next_seq.wrapping_add(1);
                        let priority = slot.priority;
                        let period = slot.period;
                        let callback = slot.callback;
                        let key = self.slots.insert(Slot { token, priority, period, callback });
                        self.heap.push(Reverse(HeapEntry {
                            deadline: next_deadline,
                            priority,
                            seq,
                            key,
                            token,
                        }));
                    }
                }
                Callback::Flag(ref flag) => {
                    flag.store(true, Ordering::SeqCst);
                }
            }
        }

        fired
    }

    fn drop_stale(&mut self) {
        while let Some(Reverse(top)) = self.heap.peek() {
            match self.slots.get(top.key) {
                Some(slot) if slot.token == top.token => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}

impl Default for TimerList {
    fn default() -> TimerList {
        TimerList::new()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn oneoff_fires_once() {
        let mut timers = TimerList::new();
        let count = Rc::new(RefCell::new(0));
        let count2 = count.clone();
        timers.schedule_after(TimeVal::ZERO, TimeVal::from_millis(10), 0, move || {
            *count2.borrow_mut() += 1;
        });

        assert_eq!(timers.run(TimeVal::from_millis(5)), 0);
        assert_eq!(timers.run(TimeVal::from_millis(10)), 1);
        assert_eq!(timers.run(TimeVal::from_millis(20)), 0);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut timers = TimerList::new();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        let handle = timers.schedule_after(TimeVal::ZERO, TimeVal::from_millis(10), 0, move || {
            *fired2.borrow_mut() = true;
        });

        timers.cancel(handle);
        timers.cancel(handle);
        timers.run(TimeVal::from_millis(20));
        assert!(!*fired.borrow());
    }

    #[test]
    fn periodic_reinserts_at_deadline_plus_period() {
        let mut timers = TimerList::new();
        let ticks = Rc::new(RefCell::new(0));
        let ticks2 = ticks.clone();
        timers.new_periodic(TimeVal::ZERO, TimeVal::from_millis(10), 0, move || {
            *ticks2.borrow_mut() += 1;
            true
        });

        timers.run(TimeVal::from_millis(10));
        timers.run(TimeVal::from_millis(20));
        timers.run(TimeVal::from_millis(30));
        assert_eq!(*ticks.borrow(), 3);
    }

    #[test]
    fn periodic_stops_when_callback_returns_false() {
        let mut timers = TimerList::new();
        let ticks = Rc::new(RefCell::new(0));
        let ticks2 = ticks.clone();
        timers.new_periodic(TimeVal::ZERO, TimeVal::from_millis(10), 0, move || {
            *ticks2.borrow_mut() += 1;
            false
        });

        timers.run(TimeVal::from_millis(10));
        timers.run(TimeVal::from_millis(100));
        assert_eq!(*ticks.borrow(), 1);
    }

    #[test]
    fn lower_priority_number_wins_at_same_deadline() {
        let mut timers = TimerList::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        timers.schedule_at(TimeVal::from_millis(10), 5, move || o1.borrow_mut().push(5));
        let o2 = order.clone();
        timers.schedule_at(TimeVal::from_millis(10), 1, move || o2.borrow_mut().push(1));
        let o3 = order.clone();
        timers.schedule_at(TimeVal::from_millis(10), 3, move || o3.borrow_mut().push(3));

        timers.run(TimeVal::from_millis(10));
        assert_eq!(*order.borrow(), vec![1, 3, 5]);
    }

    #[test]
    fn insertion_order_preserved_within_same_priority() {
        let mut timers = TimerList::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..5 {
            let o = order.clone();
            timers.schedule_at(TimeVal::from_millis(10), 0, move || o.borrow_mut().push(i));
        }

        timers.run(TimeVal::from_millis(10));
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn get_next_delay_reflects_earliest_deadline() {
        let mut timers = TimerList::new();
        timers.schedule_at(TimeVal::from_millis(50), 0, || {});
        timers.schedule_at(TimeVal::from_millis(10), 0, || {});

        assert_eq!(timers.get_next_delay(TimeVal::ZERO), TimeVal::from_millis(10));
        assert_eq!(timers.get_next_delay(TimeVal::from_millis(10)), TimeVal::ZERO);
    }

    #[test]
    fn rescheduling_self_from_within_callback_is_safe() {
        let mut timers = Rc::new(RefCell::new(TimerList::new()));
        let fire_count = Rc::new(RefCell::new(0));

        fn schedule(timers: &Rc<RefCell<TimerList>>, fire_count: &Rc<RefCell<i32>>) {
            let timers2 = timers.clone();
            let fire_count2 = fire_count.clone();
            timers.borrow_mut().schedule_after(
                TimeVal::ZERO,
                TimeVal::from_millis(10),
                0,
                move || {
                    *fire_count2.borrow_mut() += 1;
                    if *fire_count2.borrow() < 3 {
                        schedule(&timers2, &fire_count2);
                    }
                },
            );
        }

        schedule(&timers, &fire_count);
        for ms in [10, 20, 30] {
            let now = TimeVal::from_millis(ms);
            timers.borrow_mut().run(now);
        }
        assert_eq!(*fire_count.borrow(), 3);
    }
}
