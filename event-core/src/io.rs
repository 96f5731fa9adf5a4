//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Per-descriptor readiness dispatch.
//!
//! Grounded on XORP's `libxorp/selector.cc` (`SelectorList`): a
//! descriptor may have at most one callback per event kind, readiness is
//! translated into callback dispatch, and a descriptor that turns out to
//! be invalid gets every one of its registered kinds synthesised so the
//! owner can tear it down. `SelectorList` multiplexes with `select(2)`;
//! this module uses `epoll(7)` instead (Linux-only, as the workspace
//! already assumes via `nix`'s `poll` feature), mapping XORP's three-bit
//! `SEL_RD`/`SEL_WR`/`SEL_EX` mask onto six descriptor-facing kinds.

use std::collections::HashMap;
use std::os::fd::RawFd;

use crate::clock::TimeVal;
use crate::error::Error;

pub const PRIORITY_INFINITY: i32 = i32::MAX;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum IoEventKind {
    Read,
    Write,
    Exception,
    Accept,
    Connect,
    Disconnect,
    // Removal-only wildcard: matches every kind registered on a descriptor.
    Any,
}

impl IoEventKind {
    const ALL: [IoEventKind; 6] = [
        IoEventKind::Read,
        IoEventKind::Write,
        IoEventKind::Exception,
        IoEventKind::Accept,
        IoEventKind::Connect,
        IoEventKind::Disconnect,
    ];

    // The epoll bit a registration of this kind requires.
    fn epoll_bit(&self) -> u32 {
        match self {
            IoEventKind::Read | IoEventKind::Accept => libc::EPOLLIN as u32,
            IoEventKind::Write | IoEventKind::Connect => libc::EPOLLOUT as u32,
            IoEventKind::Exception => libc::EPOLLPRI as u32,
            IoEventKind::Disconnect => libc::EPOLLRDHUP as u32,
            IoEventKind::Any => 0,
        }
    }
}

// Callbacks receive the dispatcher itself (the registration has already
// been pulled out of it for the duration of the call, see
// `dispatch_one`), so they may freely add, remove or replace
// registrations on any descriptor, including their own, from within the
// call.
type Callback = Box<dyn FnMut(&mut IoEventDispatcher, RawFd, IoEventKind)>;

struct Registration {
    priority: i32,
    callback: Callback,
    // DISCONNECT must be reported at most once per registration.
    disconnect_reported: bool,
}

#[derive(Default)]
struct FdState {
    by_kind: HashMap<IoEventKind, Registration>,
}

impl FdState {
    fn interest_mask(&self) -> u32 {
        self.by_kind.keys().fold(0u32, |mask, kind| mask | kind.epoll_bit())
    }
}

pub struct IoEventDispatcher {
    epoll_fd: RawFd,
    descriptors: HashMap<RawFd, FdState>,
    // (fd, kind) pairs observed ready by the last epoll_wait but not yet
    // dispatched; refilled lazily so `ready`/`get_ready_priority` can be
    // queried without necessarily consuming an event.
    pending: Vec<(RawFd, IoEventKind)>,
}

impl IoEventDispatcher {
    pub fn new() -> std::io::Result<IoEventDispatcher> {
        // SAFETY: epoll_create1 has no preconditions beyond the flags
        // argument being valid; 0 requests no special behavior.
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(IoEventDispatcher { epoll_fd, descriptors: HashMap::new(), pending: Vec::new() })
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }

    pub fn add_ioevent_cb(
        &mut self,
        fd: RawFd,
        kind: IoEventKind,
        priority: i32,
        callback: impl FnMut(&mut IoEventDispatcher, RawFd, IoEventKind) + 'static,
    ) -> bool {
        if matches!(kind, IoEventKind::Any) || fd < 0 {
            return false;
        }

        let state = self.descriptors.entry(fd).or_default();
        if state.by_kind.contains_key(&kind) {
            return false;
        }

        let previous_mask = state.interest_mask();
        state.by_kind.insert(
            kind,
            Registration { priority, callback: Box::new(callback), disconnect_reported: false },
        );
        let new_mask = state.interest_mask();

        if previous_mask == 0 {
            if !self.epoll_add(fd, new_mask) {
                self.descriptors.get_mut(&fd).unwrap().by_kind.remove(&kind);
                return false;
            }
        } else if new_mask != previous_mask && !self.epoll_modify(fd, new_mask) {
            self.descriptors.get_mut(&fd).unwrap().by_kind.remove(&kind);
            return false;
        }

        true
    }

    pub fn remove_ioevent_cb(&mut self, fd: RawFd, kind: IoEventKind) -> bool {
        let Some(state) = self.descriptors.get_mut(&fd) else {
            return false;
        };

        let removed = if matches!(kind, IoEventKind::Any) {
            let any = !state.by_kind.is_empty();
            state.by_kind.clear();
            any
        } else {
            state.by_kind.remove(&kind).is_some()
        };

        if !removed {
            return false;
        }

        self.pending.retain(|(pfd, pkind)| {
            *pfd != fd || (!matches!(kind, IoEventKind::Any) && *pkind != kind)
        });

        if state.by_kind.is_empty() {
            self.epoll_remove(fd);
            self.descriptors.remove(&fd);
        } else {
            let mask = state.interest_mask();
            self.epoll_modify(fd, mask);
        }

        true
    }

    // Refreshes `pending` with a non-blocking poll, appending any newly
    // observed readiness without discarding events already queued.
    fn poll_pending(&mut self) {
        self.epoll_wait(0);
    }

    pub fn ready(&mut self) -> bool {
        self.poll_pending();
        !self.pending.is_empty()
    }

    pub fn get_ready_priority(&mut self) -> i32 {
        self.poll_pending();
        self.pending
            .iter()
            .filter_map(|(fd, kind)| {
                self.descriptors.get(fd).and_then(|s| s.by_kind.get(kind)).map(|r| r.priority)
            })
            .min()
            .unwrap_or(PRIORITY_INFINITY)
    }

    // Blocks for at most `timeout` (zero or negative polls) and dispatches
    // the single highest-priority ready (fd, kind) pair, if any.
    pub fn wait_and_dispatch(&mut self, timeout: TimeVal) {
        if self.pending.is_empty() {
            let millis = if timeout.as_micros() <= 0 {
                0
            } else {
                (timeout.as_micros() / 1_000).clamp(0, i32::MAX as i64) as i32
            };
            self.epoll_wait(millis);
        }
        self.dispatch_one();
    }

    fn dispatch_one(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let best = self
            .pending
            .iter()
            .enumerate()
            .filter_map(|(idx, (fd, kind))| {
                self.descriptors
                    .get(fd)
                    .and_then(|s| s.by_kind.get(kind))
                    .map(|r| (r.priority, idx))
            })
            .min();

        let Some((_, idx)) = best else {
            self.pending.clear();
            return;
        };

        let (fd, kind) = self.pending.remove(idx);
        let Some(state) = self.descriptors.get_mut(&fd) else { return };
        let Some(mut reg) = state.by_kind.remove(&kind) else { return };

        if matches!(kind, IoEventKind::Disconnect) {
            if reg.disconnect_reported {
                return;
            }
            reg.disconnect_reported = true;
        }

        // The registration is pulled out of the map for the duration of
        // the call so a callback that adds or removes registrations
        // (including this one) on the same descriptor never aliases it,
        // and so it can take `&mut self` to do so.
        let mut callback = reg.callback;
        callback(self, fd, kind);
        reg.callback = callback;

        if let Some(state) = self.descriptors.get_mut(&fd) {
            state.by_kind.entry(kind).or_insert(reg);
        }
    }

    fn epoll_add(&self, fd: RawFd, mask: u32) -> bool {
        let mut ev = libc::epoll_event { events: mask, u64: fd as u64 };
        // SAFETY: `epoll_fd` is a live epoll instance owned by `self`, and
        // `ev` is a valid, fully-initialized epoll_event.
        unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) == 0 }
    }

    fn epoll_modify(&self, fd: RawFd, mask: u32) -> bool {
        let mut ev = libc::epoll_event { events: mask, u64: fd as u64 };
        // SAFETY: see `epoll_add`.
        unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) == 0 }
    }

    fn epoll_remove(&self, fd: RawFd) {
        // SAFETY: the `ev` pointer is ignored by the kernel for
        // EPOLL_CTL_DEL on the kernel versions this code targets, but a
        // valid pointer is still passed for portability with older
        // kernels that dereference it.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut ev);
        }
    }

    fn epoll_wait(&mut self, timeout_millis: i32) {
        let mut events: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
        // SAFETY: `events` is a correctly sized buffer for up to 64
        // results, and `epoll_fd` is a live epoll instance.
        let n = unsafe {
            libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), events.len() as i32, timeout_millis)
        };

        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                Error::CallbackPanicked(format!("epoll_wait failed: {err}")).log();
                self.reap_bad_descriptors();
            }
            return;
        }

        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            let Some(state) = self.descriptors.get(&fd) else { continue };

            let bad = ev.events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0
                && ev.events & (libc::EPOLLIN as u32 | libc::EPOLLOUT as u32) == 0;
            if bad {
                for kind in state.by_kind.keys() {
                    self.pending.push((fd, *kind));
                }
                continue;
            }

            for kind in IoEventKind::ALL {
                if kind.epoll_bit() == 0 || ev.events & kind.epoll_bit() == 0 {
                    continue;
                }
                let Some(reg) = state.by_kind.get(&kind) else { continue };
                if matches!(kind, IoEventKind::Disconnect) && reg.disconnect_reported {
                    continue;
                }
                if self.pending.contains(&(fd, kind)) {
                    continue;
                }
                self.pending.push((fd, kind));
            }
        }
    }

    // Scans every registered descriptor for validity (`fcntl(F_GETFD)`)
    // and synthesises a callback for every kind registered on any
    // descriptor that has gone bad, mirroring
    // `SelectorList::callback_bad_descriptors`.
    fn reap_bad_descriptors(&mut self) {
        let bad_fds: Vec<RawFd> = self
            .descriptors
            .keys()
            .copied()
            .filter(|&fd| unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0)
            .collect();

        for fd in bad_fds {
            if let Some(state) = self.descriptors.get(&fd) {
                for kind in state.by_kind.keys() {
                    self.pending.push((fd, *kind));
                }
            }
        }
    }
}

impl Drop for IoEventDispatcher {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}
