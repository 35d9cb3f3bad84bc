//! Per-control-device upstream queue (§4.B).
//!
//! A bounded FIFO of serialized messages, budgeted at 16 KiB measured as
//! `Σ(entry_len + entry_header)`. This is the async analogue of the
//! kernel's `spinlock_t` + `wait_queue_head_t` pair: a `tokio::sync::Mutex`
//! guards the queue and a `tokio::sync::Notify` plays the role of the
//! waitqueue, the same pattern the teacher uses for its channel-backed
//! multi-client transports (`tokio::sync::mpsc` in `ipc/unix_domain_socket.rs`),
//! adapted here because we additionally need a "peek without consuming"
//! read (framing must not lose a message that didn't fit the caller buffer).

use crate::error::{Error, Result};
use crate::message::CtrlMessage;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Per-entry bookkeeping overhead counted against the budget, mirroring the
/// kernel's `sizeof(struct upqueue_entry)` in `upqentry_size()`.
const ENTRY_HEADER_BYTES: usize = 16;

/// Maximum number of bytes of serialized messages (the `Σ(entry_len + entry_header)` sum from
/// the spec) a single control device's upstream queue may hold.
pub const UPQUEUE_SIZE_MAX: usize = 1 << 14; // 16 KiB

struct Entry {
    bytes: Vec<u8>,
}

impl Entry {
    fn accounted_size(&self) -> usize {
        self.bytes.len() + ENTRY_HEADER_BYTES
    }
}

struct Inner {
    entries: VecDeque<Entry>,
    size: usize,
}

/// Bounded FIFO of serialized messages destined for one control device.
pub struct UpstreamQueue {
    inner: Mutex<Inner>,
    readable: Notify,
    writable: Notify,
}

impl Default for UpstreamQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                size: 0,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Serializes `msg` and appends it to the queue.
    ///
    /// If the budget would overflow and `may_block` is set, waits up to 5ms
    /// for space to free up (matching `rl_upqueue_append`'s bounded retry);
    /// otherwise fails immediately with `Error::NoSpace`.
    pub async fn append(&self, msg: &CtrlMessage, may_block: bool) -> Result<()> {
        let bytes = msg.to_bytes()?;
        let entry = Entry { bytes };

        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.size + entry.accounted_size() <= UPQUEUE_SIZE_MAX {
                    inner.size += entry.accounted_size();
                    inner.entries.push_back(Entry {
                        bytes: entry.bytes,
                    });
                    drop(inner);
                    self.readable.notify_waiters();
                    return Ok(());
                }
            }

            if !may_block {
                return Err(Error::NoSpace("upstream queue overrun".into()));
            }

            let waited = tokio::time::timeout(Duration::from_millis(5), self.writable.notified())
                .await
                .is_ok();
            if !waited {
                return Err(Error::NoSpace(
                    "upstream queue overrun (timed out waiting for space)".into(),
                ));
            }
        }
    }

    /// Reads and removes the head message into `buf`, returning the number
    /// of bytes written.
    ///
    /// - `blocking = false` on an empty queue fails with `Error::WouldBlock`.
    /// - `blocking = true` on an empty queue waits until a message arrives.
    /// - If the head message is longer than `buf`, fails with
    ///   `Error::Invalid("buffer-too-small")` and leaves the message queued
    ///   (one message per read; partial reads are never delivered).
    pub async fn read(&self, buf: &mut [u8], blocking: bool) -> Result<usize> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(front) = inner.entries.front() {
                    if front.bytes.len() > buf.len() {
                        return Err(Error::Invalid("buffer-too-small".into()));
                    }
                    let entry = inner.entries.pop_front().unwrap();
                    inner.size -= entry.accounted_size();
                    buf[..entry.bytes.len()].copy_from_slice(&entry.bytes);
                    drop(inner);
                    self.writable.notify_waiters();
                    return Ok(entry.bytes.len());
                }
            }

            if !blocking {
                return Err(Error::WouldBlock);
            }
            self.readable.notified().await;
        }
    }

    /// True iff at least one message is queued (poll-readable, §4.B/§6).
    pub async fn is_readable(&self) -> bool {
        !self.inner.lock().await.entries.is_empty()
    }

    /// Always true: backpressure happens inside `append`, never on the
    /// write-readiness check, matching `poll`'s contract in §4.B.
    pub fn is_writable(&self) -> bool {
        true
    }

    /// Current budget usage in bytes, for the `|upstream_queue(D)| ≤ 16 KiB`
    /// invariant in §8.
    pub async fn len_bytes(&self) -> usize {
        self.inner.lock().await.size
    }
}
