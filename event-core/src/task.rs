//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Weighted round-robin dispatch of background work, run only when no
//! timer or I/O event is more urgent.
//!
//! Grounded on XORP's `libxorp/round_robin.cc` (`RoundRobinQueue`): a
//! circular list per priority where the head task is dispatched `weight`
//! consecutive times before the list rotates to the next task, so a
//! heavier task gets proportionally more of the CPU without starving its
//! neighbours. The original is an intrusive doubly-linked list; here a
//! `VecDeque` plays the same role since tasks don't need to unlink
//! themselves from the middle of the queue (there is no `cancel`
//! operation for tasks, unlike timers and I/O registrations).

use std::collections::{BTreeMap, VecDeque};

pub const PRIORITY_INFINITY: i32 = i32::MAX;

enum TaskKind {
    OneOff(Option<Box<dyn FnOnce()>>),
    Repeating(Box<dyn FnMut() -> bool>),
}

struct TaskSlot {
    weight: u32,
    kind: TaskKind,
}

#[derive(Default)]
struct Queue {
    tasks: VecDeque<TaskSlot>,
    run_count: u32,
}

#[derive(Default)]
pub struct TaskList {
    queues: BTreeMap<i32, Queue>,
}

impl TaskList {
    pub fn new() -> TaskList {
        TaskList::default()
    }

    pub fn new_oneoff_task(
        &mut self,
        priority: i32,
        weight: u32,
        callback: impl FnOnce() + 'static,
    ) {
        let queue = self.queues.entry(priority).or_default();
        queue.tasks.push_back(TaskSlot {
            weight: weight.max(1),
            kind: TaskKind::OneOff(Some(Box::new(callback))),
        });
    }

    pub fn new_task(
        &mut self,
        priority: i32,
        weight: u32,
        callback: impl FnMut() -> bool + 'static,
    ) {
        let queue = self.queues.entry(priority).or_default();
        queue.tasks.push_back(TaskSlot {
            weight: weight.max(1),
            kind: TaskKind::Repeating(Box::new(callback)),
        });
    }

    pub fn get_runnable_priority(&self) -> i32 {
        self.queues
            .iter()
            .find(|(_, q)| !q.tasks.is_empty())
            .map(|(p, _)| *p)
            .unwrap_or(PRIORITY_INFINITY)
    }

    pub fn empty(&self) -> bool {
        self.queues.values().all(|q| q.tasks.is_empty())
    }

    // Dispatches the head task of the highest-priority non-empty queue.
    // Returns whether any task was dispatched.
    pub fn run(&mut self) -> bool {
        let Some(priority) = self
            .queues
            .iter()
            .find(|(_, q)| !q.tasks.is_empty())
            .map(|(p, _)| *p)
        else {
            return false;
        };

        let queue = self.queues.get_mut(&priority).unwrap();
        let Some(mut slot) = queue.tasks.pop_front() else { return false };
        queue.run_count += 1;

        let keep = match &mut slot.kind {
            TaskKind::OneOff(cb) => {
                if let Some(cb) = cb.take() {
                    cb();
                }
                false
            }
            TaskKind::Repeating(cb) => cb(),
        };

        if keep && queue.run_count < slot.weight {
            queue.tasks.push_front(slot);
        } else if keep {
            queue.tasks.push_back(slot);
            queue.run_count = 0;
        } else {
            queue.run_count = 0;
        }

        true
    }
}
