// Anonymous pipes for IPC between processes.
//
// Reader/writer wake each other through a pair of wait queues the same
// way `process::wait::do_wait4` parks on `waitpid_waitlist`: the same
// mutex that guards the buffer is handed to `scheduler::wait` as both
// the lock to drop going to sleep and the lock to reacquire on wake.

use crate::lib::error::{Errno, Result};
use crate::process::scheduler::{self, WaitQueue};
use crate::vfs::poll::{PollEvents, PollHead};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use spin::Mutex;

/// Pipe buffer size (4KB)
const PIPE_BUF_SIZE: usize = 4096;

struct PipeState {
    buffer: VecDeque<u8>,
    reader_count: usize,
    writer_count: usize,
}

/// Shared pipe buffer plus the wait queues its reader/writer ends block
/// on. One `Pipe` backs one `PipeReader`/`PipeWriter` pair (and however
/// many clones of each `dup`/`fork` produce).
pub struct Pipe {
    state: Mutex<PipeState>,
    read_waiters: WaitQueue,
    write_waiters: WaitQueue,
    poll_head: Arc<PollHead>,
}

impl Pipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PipeState {
                buffer: VecDeque::with_capacity(PIPE_BUF_SIZE),
                reader_count: 1,
                writer_count: 1,
            }),
            read_waiters: WaitQueue::new(),
            write_waiters: WaitQueue::new(),
            poll_head: Arc::new(PollHead::new()),
        })
    }

    /// Blocks until data is available or every writer has closed, in
    /// which case it returns `Ok(0)` (EOF).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        loop {
            if !state.buffer.is_empty() {
                let to_read = buf.len().min(state.buffer.len());
                for slot in buf.iter_mut().take(to_read) {
                    *slot = state.buffer.pop_front().unwrap();
                }
                drop(state);
                scheduler::notify_all(&self.write_waiters);
                self.poll_head.notify();
                return Ok(to_read);
            }
            if state.writer_count == 0 {
                return Ok(0);
            }
            state = scheduler::wait(&self.read_waiters, &self.state, state);
        }
    }

    /// Blocks until space is available. Returns `EPIPE` (and raises
    /// `SIGPIPE` on the calling process) if every reader has closed.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock();
        loop {
            if state.reader_count == 0 {
                drop(state);
                if let Some(task) = crate::process::current_task() {
                    let _ = crate::process::signal::send_to_process(task.pid, crate::process::signal::SIGPIPE);
                }
                return Err(Errno::EPIPE);
            }

            let available = PIPE_BUF_SIZE - state.buffer.len();
            if available > 0 {
                let to_write = buf.len().min(available);
                for &byte in &buf[..to_write] {
                    state.buffer.push_back(byte);
                }
                drop(state);
                scheduler::notify_all(&self.read_waiters);
                self.poll_head.notify();
                return Ok(to_write);
            }

            state = scheduler::wait(&self.write_waiters, &self.state, state);
        }
    }

    pub fn add_reader(&self) {
        self.state.lock().reader_count += 1;
    }

    pub fn remove_reader(&self) {
        let mut state = self.state.lock();
        if state.reader_count > 0 {
            state.reader_count -= 1;
        }
        let closed = state.reader_count == 0;
        drop(state);
        if closed {
            scheduler::notify_all(&self.write_waiters);
            self.poll_head.notify();
        }
    }

    pub fn add_writer(&self) {
        self.state.lock().writer_count += 1;
    }

    pub fn remove_writer(&self) {
        let mut state = self.state.lock();
        if state.writer_count > 0 {
            state.writer_count -= 1;
        }
        let closed = state.writer_count == 0;
        drop(state);
        if closed {
            scheduler::notify_all(&self.read_waiters);
            self.poll_head.notify();
        }
    }

    /// Computes `revents` against the caller's `events` mask, matching
    /// `InodeOps::poll`'s contract.
    pub fn poll(&self, events: u16) -> u16 {
        let state = self.state.lock();
        let mut revents = 0u16;
        if !state.buffer.is_empty() || state.writer_count == 0 {
            revents |= events & PollEvents::POLLIN.bits();
        }
        if state.buffer.len() < PIPE_BUF_SIZE || state.reader_count == 0 {
            revents |= events & PollEvents::POLLOUT.bits();
        }
        if state.reader_count == 0 {
            revents |= PollEvents::POLLERR.bits();
        }
        revents
    }

    pub fn poll_head(&self) -> Arc<PollHead> {
        self.poll_head.clone()
    }
}

/// Pipe read end
#[derive(Clone)]
pub struct PipeReader {
    pipe: Arc<Pipe>,
}

impl PipeReader {
    pub fn new(pipe: Arc<Pipe>) -> Self {
        pipe.add_reader();
        Self { pipe }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.pipe.read(buf)
    }

    pub fn poll(&self, events: u16) -> u16 {
        self.pipe.poll(events)
    }

    pub fn poll_head(&self) -> Arc<PollHead> {
        self.pipe.poll_head()
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.pipe.remove_reader();
    }
}

/// Pipe write end
#[derive(Clone)]
pub struct PipeWriter {
    pipe: Arc<Pipe>,
}

impl PipeWriter {
    pub fn new(pipe: Arc<Pipe>) -> Self {
        pipe.add_writer();
        Self { pipe }
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.pipe.write(buf)
    }

    pub fn poll(&self, events: u16) -> u16 {
        self.pipe.poll(events)
    }

    pub fn poll_head(&self) -> Arc<PollHead> {
        self.pipe.poll_head()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.pipe.remove_writer();
    }
}

/// Create a new pipe (returns reader and writer)
pub fn create_pipe() -> (PipeReader, PipeWriter) {
    let pipe = Pipe::new();
    let reader = PipeReader::new(pipe.clone());
    let writer = PipeWriter::new(pipe);
    (reader, writer)
}

// Pipe ends are wrapped in File objects in vfs/file.rs using File::from_pipe_reader/writer.
