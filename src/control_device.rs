//! Per-open-handle control device state (§3, §6).
//!
//! One `ControlDevice` exists per connected client (application or uipcp).
//! It owns the outbound `UpstreamQueue`, the two fetch cursors and the
//! subscription flag; `server.rs` drives it from a Tokio connection task the
//! same way the teacher drives one `tokio::sync::mpsc` receiver per
//! connection in `ipc/unix_domain_socket.rs`.

use crate::fetch::FetchCursors;
use crate::queue::UpstreamQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Process-wide monotonic source of `ControlDevice` ids, also used as the
/// `OwnerId` for application-registry ownership checks.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct ControlDevice {
    pub id: u64,
    pub namespace: String,
    pub upstream: UpstreamQueue,
    pub fetch: FetchCursors,
    subscribed: AtomicBool,
    /// Set once this control device has been bound as a uipcp for some
    /// IPCP (`UIPCP_SET`); used by handlers that need to tell a uipcp
    /// connection apart from a plain application connection.
    pub is_uipcp: AtomicBool,
    /// Result of the peer-credential capability check performed by
    /// `server.rs` at connection time (§4.H capability table, §7 "no
    /// security beyond a simple privileged/unprivileged capability check").
    privileged: AtomicBool,
}

impl ControlDevice {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            namespace: namespace.into(),
            upstream: UpstreamQueue::new(),
            fetch: FetchCursors::new(),
            subscribed: AtomicBool::new(false),
            is_uipcp: AtomicBool::new(false),
            privileged: AtomicBool::new(false),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    pub fn set_subscribed(&self, value: bool) {
        self.subscribed.store(value, Ordering::Release);
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged.load(Ordering::Acquire)
    }

    pub fn set_privileged(&self, value: bool) {
        self.privileged.store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_and_monotonic() {
        let a = ControlDevice::new("ns");
        let b = ControlDevice::new("ns");
        assert!(b.id > a.id);
    }
}
