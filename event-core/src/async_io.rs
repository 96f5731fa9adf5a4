//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Non-blocking buffered read/write state machines driven by an
//! [`IoEventDispatcher`].
//!
//! Grounded on XORP's `libxorp/asyncio.cc` (`AsyncFileReader` /
//! `AsyncFileWriter`): the caller enqueues buffers, the operator
//! registers for readiness and drains or fills them with non-blocking
//! syscalls, invoking a per-buffer completion callback as it makes
//! progress. The writer's self-deletion guard mirrors the original's
//! `_dtoken` reference-counted sentinel: a `Weak` handle to a token held
//! only by the writer itself is upgraded before invoking a user
//! callback, and if the resulting strong count falls back to one
//! afterward the callback dropped the writer, so no further state is
//! touched. Enqueuing a buffer onto a running writer attempts a write
//! immediately instead of waiting for the next readiness notification
//! (the level-triggered analogue of the original's `immediate_write`),
//! so a writer whose socket always has room doesn't starve.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;

use socket2::SockAddr;

use crate::io::{IoEventDispatcher, IoEventKind};

const MAX_COALESCE: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    // Forward progress was made (reader: any progress; writer: a buffer
    // was fully sent).
    Data,
    // Reader only: a zero-byte read on a stream socket.
    EndOfFile,
    OsError,
    // The buffer was dropped unsent/unread by `flush_buffers`.
    Flushing,
}

type Callback = Box<dyn FnMut(Event, &[u8], usize)>;

struct BufferEntry {
    buf: Vec<u8>,
    offset: usize,
    // Writer only: `Some` marks a datagram buffer sent whole via
    // `sendto`, never coalesced with neighbours.
    dest: Option<SocketAddr>,
    callback: Callback,
}

fn retryable(err: &std::io::Error) -> bool {
    matches!(err.kind(), std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock)
}

// ===== AsyncReader =====

struct ReaderInner {
    fd: RawFd,
    priority: i32,
    running: bool,
    queue: VecDeque<BufferEntry>,
}

pub struct AsyncReader {
    inner: Rc<RefCell<ReaderInner>>,
}

impl AsyncReader {
    pub fn new(fd: RawFd, priority: i32) -> AsyncReader {
        AsyncReader {
            inner: Rc::new(RefCell::new(ReaderInner {
                fd,
                priority,
                running: false,
                queue: VecDeque::new(),
            })),
        }
    }

    pub fn add_buffer(&self, buf: Vec<u8>, callback: impl FnMut(Event, &[u8], usize) + 'static) {
        self.add_buffer_with_offset(buf, 0, callback);
    }

    pub fn add_buffer_with_offset(
        &self,
        buf: Vec<u8>,
        offset: usize,
        callback: impl FnMut(Event, &[u8], usize) + 'static,
    ) {
        self.inner.borrow_mut().queue.push_back(BufferEntry {
            buf,
            offset,
            dest: None,
            callback: Box::new(callback),
        });
    }

    pub fn buffers_remaining(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    pub fn running(&self) -> bool {
        self.inner.borrow().running
    }

    // Starts (or resumes) reading. Returns false if no buffers are queued.
    pub fn start(&self, io: &mut IoEventDispatcher) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.running {
            return true;
        }
        if inner.queue.is_empty() {
            return false;
        }
        let fd = inner.fd;
        let priority = inner.priority;
        drop(inner);

        let handle = self.inner.clone();
        let registered = io.add_ioevent_cb(fd, IoEventKind::Read, priority, move |io, fd, _kind| {
            on_readable(&handle, io, fd);
        });
        if registered {
            self.inner.borrow_mut().running = true;
        }
        registered
    }

    // Removes the readiness registration but keeps queued buffers.
    pub fn stop(&self, io: &mut IoEventDispatcher) {
        let mut inner = self.inner.borrow_mut();
        if !inner.running {
            return;
        }
        inner.running = false;
        let fd = inner.fd;
        drop(inner);
        io.remove_ioevent_cb(fd, IoEventKind::Read);
    }

    // Stops, then drains the queue delivering `Flushing` to each pending
    // buffer in FIFO order.
    pub fn flush_buffers(&self, io: &mut IoEventDispatcher) {
        self.stop(io);
        let drained: Vec<BufferEntry> = self.inner.borrow_mut().queue.drain(..).collect();
        for mut entry in drained {
            (entry.callback)(Event::Flushing, &entry.buf, entry.offset);
        }
    }
}

fn on_readable(inner: &Rc<RefCell<ReaderInner>>, io: &mut IoEventDispatcher, fd: RawFd) {
    loop {
        let mut borrowed = inner.borrow_mut();
        if !borrowed.running || borrowed.queue.is_empty() {
            return;
        }
        let mut entry = borrowed.queue.pop_front().unwrap();
        drop(borrowed);

        let remaining = &mut entry.buf[entry.offset..];
        // SAFETY: `fd` is owned by the caller and kept open for the
        // lifetime of this reader; `remaining` is a valid, live slice.
        let n = unsafe {
            libc::read(fd, remaining.as_mut_ptr() as *mut libc::c_void, remaining.len())
        };

        if n < 0 {
            let err = std::io::Error::last_os_error();
            if retryable(&err) {
                inner.borrow_mut().queue.push_front(entry);
                return;
            }
            (entry.callback)(Event::OsError, &entry.buf, entry.offset);
            fail_remaining(inner, io, fd, IoEventKind::Read);
            return;
        }

        if n == 0 {
            (entry.callback)(Event::EndOfFile, &entry.buf, entry.offset);
            stop_locked(inner, io, fd, IoEventKind::Read);
            return;
        }

        entry.offset += n as usize;
        let done = entry.offset == entry.buf.len();
        (entry.callback)(Event::Data, &entry.buf, entry.offset);

        if done {
            let mut borrowed = inner.borrow_mut();
            if borrowed.queue.is_empty() {
                drop(borrowed);
                stop_locked(inner, io, fd, IoEventKind::Read);
                return;
            }
            // Buffer retired; loop to try the next one without waiting
            // for another readiness notification, matching the "drain
            // while data is available" reader contract.
            continue;
        } else {
            inner.borrow_mut().queue.push_front(entry);
            return;
        }
    }
}

fn stop_locked(inner: &Rc<RefCell<ReaderInner>>, io: &mut IoEventDispatcher, fd: RawFd, kind: IoEventKind) {
    inner.borrow_mut().running = false;
    io.remove_ioevent_cb(fd, kind);
}

fn fail_remaining(
    inner: &Rc<RefCell<ReaderInner>>,
    io: &mut IoEventDispatcher,
    fd: RawFd,
    kind: IoEventKind,
) {
    stop_locked(inner, io, fd, kind);
    let drained: Vec<BufferEntry> = inner.borrow_mut().queue.drain(..).collect();
    for mut entry in drained {
        (entry.callback)(Event::OsError, &entry.buf, entry.offset);
    }
}

// ===== AsyncWriter =====

struct WriterInner {
    fd: RawFd,
    priority: i32,
    coalesce: usize,
    running: bool,
    queue: VecDeque<BufferEntry>,
}

pub struct AsyncWriter {
    inner: Rc<RefCell<WriterInner>>,
    // Held only by this struct; the I/O-registered closure captures a
    // `Weak` derived from it, never a strong clone. Upgrading the weak
    // ref around a user callback lets the dispatch loop tell whether the
    // callback dropped the writer out from under it.
    dtoken: Rc<()>,
}

impl AsyncWriter {
    pub fn new(fd: RawFd, priority: i32, coalesce: usize) -> AsyncWriter {
        AsyncWriter {
            inner: Rc::new(RefCell::new(WriterInner {
                fd,
                priority,
                coalesce: coalesce.clamp(1, MAX_COALESCE),
                running: false,
                queue: VecDeque::new(),
            })),
            dtoken: Rc::new(()),
        }
    }

    pub fn add_buffer(
        &self,
        io: &mut IoEventDispatcher,
        buf: Vec<u8>,
        callback: impl FnMut(Event, &[u8], usize) + 'static,
    ) {
        self.enqueue(io, buf, 0, None, callback);
    }

    pub fn add_buffer_with_offset(
        &self,
        io: &mut IoEventDispatcher,
        buf: Vec<u8>,
        offset: usize,
        callback: impl FnMut(Event, &[u8], usize) + 'static,
    ) {
        self.enqueue(io, buf, offset, None, callback);
    }

    // A datagram buffer is sent whole via `sendto` and never coalesced
    // with neighbouring buffers.
    pub fn add_buffer_sendto(
        &self,
        io: &mut IoEventDispatcher,
        buf: Vec<u8>,
        dest: SocketAddr,
        callback: impl FnMut(Event, &[u8], usize) + 'static,
    ) {
        self.enqueue(io, buf, 0, Some(dest), callback);
    }

    fn enqueue(
        &self,
        io: &mut IoEventDispatcher,
        buf: Vec<u8>,
        offset: usize,
        dest: Option<SocketAddr>,
        callback: impl FnMut(Event, &[u8], usize) + 'static,
    ) {
        let mut inner = self.inner.borrow_mut();
        inner.queue.push_back(BufferEntry { buf, offset, dest, callback: Box::new(callback) });
        let was_running = inner.running;
        let fd = inner.fd;
        drop(inner);

        if was_running {
            // Attempt a write immediately rather than waiting for the
            // next readiness notification, so a writer that always has
            // room in the socket buffer doesn't starve behind whatever
            // else the event loop is doing.
            on_writable(&self.inner, &Rc::downgrade(&self.dtoken), io, fd);
        }
    }

    pub fn buffers_remaining(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    pub fn running(&self) -> bool {
        self.inner.borrow().running
    }

    pub fn start(&self, io: &mut IoEventDispatcher) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.running {
            return true;
        }
        if inner.queue.is_empty() {
            return false;
        }
        let fd = inner.fd;
        let priority = inner.priority;
        drop(inner);

        let handle = self.inner.clone();
        let dtoken = Rc::downgrade(&self.dtoken);
        let registered = io.add_ioevent_cb(fd, IoEventKind::Write, priority, move |io, fd, _kind| {
            on_writable(&handle, &dtoken, io, fd);
        });
        if registered {
            self.inner.borrow_mut().running = true;
        }
        registered
    }

    pub fn stop(&self, io: &mut IoEventDispatcher) {
        let mut inner = self.inner.borrow_mut();
        if !inner.running {
            return;
        }
        inner.running = false;
        let fd = inner.fd;
        drop(inner);
        io.remove_ioevent_cb(fd, IoEventKind::Write);
    }

    pub fn flush_buffers(&self, io: &mut IoEventDispatcher) {
        self.stop(io);
        let drained: Vec<BufferEntry> = self.inner.borrow_mut().queue.drain(..).collect();
        for mut entry in drained {
            (entry.callback)(Event::Flushing, &entry.buf, entry.offset);
        }
    }
}

fn on_writable(
    inner: &Rc<RefCell<WriterInner>>,
    dtoken: &std::rc::Weak<()>,
    io: &mut IoEventDispatcher,
    fd: RawFd,
) {
    let mut borrowed = inner.borrow_mut();
    if !borrowed.running || borrowed.queue.is_empty() {
        return;
    }

    let first_is_datagram = borrowed.queue.front().unwrap().dest.is_some();

    let result = if first_is_datagram {
        let entry = borrowed.queue.front().unwrap();
        let dest = entry.dest.unwrap();
        let remaining = &entry.buf[entry.offset..];
        let sockaddr = SockAddr::from(dest);
        // SAFETY: `fd` is a live datagram socket; `remaining`/`sockaddr`
        // are valid for the duration of the call.
        let n = unsafe {
            libc::sendto(
                fd,
                remaining.as_ptr() as *const libc::c_void,
                remaining.len(),
                0,
                sockaddr.as_ptr(),
                sockaddr.len(),
            )
        };
        WriteResult::single(n)
    } else {
        let coalesce = borrowed.coalesce;
        let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(coalesce);
        for entry in borrowed.queue.iter().take(coalesce) {
            if entry.dest.is_some() {
                break;
            }
            let remaining = &entry.buf[entry.offset..];
            iovecs.push(libc::iovec {
                iov_base: remaining.as_ptr() as *mut libc::c_void,
                iov_len: remaining.len(),
            });
        }
        // SAFETY: each iovec points into a buffer owned by an entry
        // still held in `borrowed.queue` for the duration of the call.
        let n = unsafe { libc::writev(fd, iovecs.as_ptr(), iovecs.len() as i32) };
        WriteResult::single(n)
    };
    drop(borrowed);

    match result {
        WriteResult::Error(err) if retryable(&err) => {}
        WriteResult::Error(_) => {
            let mut inner_mut = inner.borrow_mut();
            let Some(mut head) = inner_mut.queue.pop_front() else { return };
            drop(inner_mut);
            let Some(guard) = dtoken.upgrade() else {
                io.remove_ioevent_cb(fd, IoEventKind::Write);
                return;
            };
            (head.callback)(Event::OsError, &head.buf, head.offset);
            if Rc::strong_count(&guard) == 1 {
                io.remove_ioevent_cb(fd, IoEventKind::Write);
                return;
            }
            fail_remaining_writer(inner, io, fd);
        }
        WriteResult::Done(n) => complete_writes(inner, dtoken, io, fd, n),
    }
}

enum WriteResult {
    Done(usize),
    Error(std::io::Error),
}

impl WriteResult {
    fn single(n: isize) -> WriteResult {
        if n < 0 { WriteResult::Error(std::io::Error::last_os_error()) } else { WriteResult::Done(n as usize) }
    }
}

fn complete_writes(
    inner: &Rc<RefCell<WriterInner>>,
    dtoken: &std::rc::Weak<()>,
    io: &mut IoEventDispatcher,
    fd: RawFd,
    mut done: usize,
) {
    loop {
        if done == 0 {
            break;
        }
        let mut borrowed = inner.borrow_mut();
        let Some(head) = borrowed.queue.front_mut() else { break };
        let needed = head.buf.len() - head.offset;

        if done < needed {
            head.offset += done;
            return;
        }

        done -= needed;
        let mut entry = borrowed.queue.pop_front().unwrap();
        let queue_now_empty = borrowed.queue.is_empty();
        drop(borrowed);

        entry.offset = entry.buf.len();
        let Some(guard) = dtoken.upgrade() else {
            io.remove_ioevent_cb(fd, IoEventKind::Write);
            return;
        };
        (entry.callback)(Event::Data, &entry.buf, entry.offset);
        if Rc::strong_count(&guard) == 1 {
            // The writer was dropped by the callback; the dispatcher
            // still owns this closure's clone of the inner state, so
            // deregister explicitly rather than leaving a registration
            // for a vanished owner.
            io.remove_ioevent_cb(fd, IoEventKind::Write);
            return;
        }

        if queue_now_empty {
            inner.borrow_mut().running = false;
            io.remove_ioevent_cb(fd, IoEventKind::Write);
            return;
        }
    }
}

fn fail_remaining_writer(inner: &Rc<RefCell<WriterInner>>, io: &mut IoEventDispatcher, fd: RawFd) {
    inner.borrow_mut().running = false;
    io.remove_ioevent_cb(fd, IoEventKind::Write);
    let drained: Vec<BufferEntry> = inner.borrow_mut().queue.drain(..).collect();
    for mut entry in drained {
        (entry.callback)(Event::OsError, &entry.buf, entry.offset);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell as StdRefCell;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    use super::*;
    use crate::io::IoEventDispatcher;

    fn make_pipe() -> (std::fs::File, std::fs::File) {
        use std::os::fd::FromRawFd;
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            let rd = std::fs::File::from_raw_fd(fds[0]);
            let wr = std::fs::File::from_raw_fd(fds[1]);
            let flags = libc::fcntl(fds[0], libc::F_GETFL);
            libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
            let flags = libc::fcntl(fds[1], libc::F_GETFL);
            libc::fcntl(fds[1], libc::F_SETFL, flags | libc::O_NONBLOCK);
            (rd, wr)
        }
    }

    #[test]
    fn reader_delivers_data_then_eof() {
        let mut io = IoEventDispatcher::new().unwrap();
        let (rd, mut wr) = make_pipe();
        let reader = AsyncReader::new(rd.as_raw_fd(), 0);

        let received = Rc::new(StdRefCell::new(Vec::new()));
        let received2 = received.clone();
        let eof = Rc::new(StdRefCell::new(false));
        let eof2 = eof.clone();
        reader.add_buffer(vec![0u8; 16], move |event, buf, offset| match event {
            Event::Data => received2.borrow_mut().extend_from_slice(&buf[..offset]),
            Event::EndOfFile => *eof2.borrow_mut() = true,
            _ => {}
        });
        assert!(reader.start(&mut io));

        wr.write_all(b"hello").unwrap();
        io.wait_and_dispatch(crate::clock::TimeVal::from_millis(100));
        drop(wr);
        io.wait_and_dispatch(crate::clock::TimeVal::from_millis(100));

        assert_eq!(&*received.borrow(), b"hello");
        assert!(*eof.borrow());
    }

    #[test]
    fn writer_reports_full_offset_once_buffer_drains() {
        let mut io = IoEventDispatcher::new().unwrap();
        let (mut rd, wr) = make_pipe();
        let writer = AsyncWriter::new(wr.as_raw_fd(), 0, 4);

        let last_offset = Rc::new(StdRefCell::new(0usize));
        let last_offset2 = last_offset.clone();
        writer.add_buffer(&mut io, b"payload".to_vec(), move |event, _buf, offset| {
            if event == Event::Data {
                *last_offset2.borrow_mut() = offset;
            }
        });
        assert!(writer.start(&mut io));
        io.wait_and_dispatch(crate::clock::TimeVal::from_millis(100));

        let mut out = [0u8; 16];
        use std::io::Read;
        let n = rd.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"payload");
        assert_eq!(*last_offset.borrow(), 7);
        assert!(!writer.running());
    }

    #[test]
    fn flush_buffers_delivers_flushing_in_fifo_order() {
        let mut io = IoEventDispatcher::new().unwrap();
        let (_rd, wr) = make_pipe();
        let writer = AsyncWriter::new(wr.as_raw_fd(), 0, 4);

        let order = Rc::new(StdRefCell::new(Vec::new()));
        let o1 = order.clone();
        writer.add_buffer(&mut io, vec![1], move |event, _, _| {
            if event == Event::Flushing {
                o1.borrow_mut().push(1);
            }
        });
        let o2 = order.clone();
        writer.add_buffer(&mut io, vec![2], move |event, _, _| {
            if event == Event::Flushing {
                o2.borrow_mut().push(2);
            }
        });

        writer.flush_buffers(&mut io);
        assert_eq!(*order.borrow(), vec![1, 2]);
        assert_eq!(writer.buffers_remaining(), 0);
    }
}
