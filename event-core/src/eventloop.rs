//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Composes [`Clock`], [`TimerList`], [`IoEventDispatcher`] and
//! [`TaskList`] into a single cooperative, single-threaded scheduler.
//!
//! Grounded directly on XORP's `libxorp/eventloop.cc`: one call to
//! [`EventLoop::run`] advances the clock, asks each of the three work
//! sources for its most urgent priority, and dispatches whichever is
//! numerically lowest (ties broken timers, then I/O, then tasks), or
//! blocks in the I/O dispatcher until the next timer deadline if nothing
//! is ready.

use std::os::fd::RawFd;
use std::time::Instant;

use crate::clock::{Clock, TimeVal};
use crate::io::{IoEventDispatcher, IoEventKind};
use crate::task::TaskList;
use crate::timer::{TimerHandle, TimerList};

const STALL_WARNING_THRESHOLD: TimeVal = TimeVal::from_micros(2_000_000);

pub struct EventLoop {
    clock: Clock,
    timers: TimerList,
    io: IoEventDispatcher,
    tasks: TaskList,
    last_run: Option<Instant>,
    last_warned: Option<Instant>,
}

impl EventLoop {
    pub fn new() -> std::io::Result<EventLoop> {
        Ok(EventLoop {
            clock: Clock::new(),
            timers: TimerList::new(),
            io: IoEventDispatcher::new()?,
            tasks: TaskList::new(),
            last_run: None,
            last_warned: None,
        })
    }

    pub fn current_time(&self) -> TimeVal {
        self.clock.current_time()
    }

    pub fn timers(&mut self) -> &mut TimerList {
        &mut self.timers
    }

    pub fn io(&mut self) -> &mut IoEventDispatcher {
        &mut self.io
    }

    pub fn tasks(&mut self) -> &mut TaskList {
        &mut self.tasks
    }

    pub fn add_ioevent_cb(
        &mut self,
        fd: RawFd,
        kind: IoEventKind,
        priority: i32,
        callback: impl FnMut(&mut IoEventDispatcher, RawFd, IoEventKind) + 'static,
    ) -> bool {
        self.io.add_ioevent_cb(fd, kind, priority, callback)
    }

    pub fn remove_ioevent_cb(&mut self, fd: RawFd, kind: IoEventKind) -> bool {
        self.io.remove_ioevent_cb(fd, kind)
    }

    pub fn descriptor_count(&self) -> usize {
        self.io.descriptor_count()
    }

    pub fn schedule_after(
        &mut self,
        delay: TimeVal,
        priority: i32,
        callback: impl FnOnce() + 'static,
    ) -> TimerHandle {
        let now = self.clock.current_time();
        self.timers.schedule_after(now, delay, priority, callback)
    }

    pub fn new_periodic(
        &mut self,
        period: TimeVal,
        priority: i32,
        callback: impl FnMut() -> bool + 'static,
    ) -> TimerHandle {
        let now = self.clock.current_time();
        self.timers.new_periodic(now, period, priority, callback)
    }

    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        self.timers.cancel(handle);
    }

    pub fn new_oneoff_task(
        &mut self,
        priority: i32,
        weight: u32,
        callback: impl FnOnce() + 'static,
    ) {
        self.tasks.new_oneoff_task(priority, weight, callback);
    }

    pub fn new_task(
        &mut self,
        priority: i32,
        weight: u32,
        callback: impl FnMut() -> bool + 'static,
    ) {
        self.tasks.new_task(priority, weight, callback);
    }

    // Executes exactly one unit of work: a timer, an I/O readiness
    // callback, a task, or (if none are ready) a bounded block in the I/O
    // dispatcher until the next deadline.
    pub fn run(&mut self) {
        self.warn_if_stalled();

        self.clock.advance();
        let now = self.clock.current_time();
        let delay = self.timers.get_next_delay(now);

        let timer_priority = if delay.is_zero() {
            self.timers.get_expired_priority(now)
        } else {
            crate::timer::PRIORITY_INFINITY
        };

        let io_priority =
            if self.io.ready() { self.io.get_ready_priority() } else { crate::io::PRIORITY_INFINITY };

        let task_priority = if !self.tasks.empty() {
            self.tasks.get_runnable_priority()
        } else {
            crate::task::PRIORITY_INFINITY
        };

        if timer_priority != crate::timer::PRIORITY_INFINITY
            && timer_priority <= io_priority
            && timer_priority <= task_priority
        {
            self.timers.run(now);
        } else if io_priority != crate::io::PRIORITY_INFINITY && io_priority <= task_priority {
            self.io.wait_and_dispatch(delay);
        } else if task_priority != crate::task::PRIORITY_INFINITY {
            self.tasks.run();
        } else {
            self.io.wait_and_dispatch(delay);
        }

        self.last_run = Some(Instant::now());
    }

    fn warn_if_stalled(&mut self) {
        let Some(last_run) = self.last_run else {
            return;
        };
        let elapsed = TimeVal::from(last_run.elapsed());
        if elapsed < STALL_WARNING_THRESHOLD {
            return;
        }
        let should_warn = match self.last_warned {
            Some(last_warned) => last_warned.elapsed().as_secs() >= 1,
            None => true,
        };
        if should_warn {
            tracing::warn!(seconds = elapsed.as_secs_f64(), "long delay between EventLoop::run calls");
            self.last_warned = Some(Instant::now());
        }
    }
}
