//! Isolation-domain root container (§3 `IsolationDomain`).
//!
//! One `Dm` per namespace: owns the IPCP table, flow table, DIF table,
//! per-IPCP application registries, the connected control-device list, and
//! the put-queue/timer that drives deferred flow destruction (§4.D).
//! `namespace.rs` keeps a refcounted table of these, one per distinct
//! namespace key, mirroring the kernel's per-netns `struct rina_dm`.

use crate::app_registry::AppRegistry;
use crate::control_device::ControlDevice;
use crate::dif::DifTable;
use crate::flow::FlowTable;
use crate::ipcp::IpcpTable;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};

/// Grace period before a never-opened flow is reclaimed by the sweep (§9
/// "unbound-flow sweep"), distinct from the (longer, per-IPCP)
/// `flow_del_wait_ms` applied after a flow leaves ALLOCATED.
pub const UNBOUND_FLOW_TIMEOUT_MS: u64 = 2000;

pub struct Dm {
    pub namespace: String,
    pub ipcps: Mutex<IpcpTable>,
    pub difs: Mutex<DifTable>,
    pub flows: RwLock<FlowTable>,
    pub app_registries: Mutex<HashMap<u16, AppRegistry>>,
    pub devices: Mutex<Vec<Arc<ControlDevice>>>,
    put_queue: Mutex<BinaryHeap<Reverse<(Instant, u32)>>>,
    put_queue_notify: Notify,
    uid_cnt: AtomicU32,
}

impl Dm {
    pub fn new(namespace: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.into(),
            ipcps: Mutex::new(IpcpTable::new()),
            difs: Mutex::new(DifTable::new()),
            flows: RwLock::new(FlowTable::new()),
            app_registries: Mutex::new(HashMap::new()),
            devices: Mutex::new(Vec::new()),
            put_queue: Mutex::new(BinaryHeap::new()),
            put_queue_notify: Notify::new(),
            uid_cnt: AtomicU32::new(0),
        })
    }

    /// Per-DM monotonically increasing flow uid (§3), used to match
    /// FA_RESP/FA_RESP_ARRIVED against the FA_REQ_ARRIVED that spawned them.
    pub fn next_uid(&self) -> u32 {
        self.uid_cnt.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register_device(&self, device: Arc<ControlDevice>) {
        self.devices.lock().await.push(device);
    }

    pub async fn unregister_device(&self, id: u64) -> Option<Arc<ControlDevice>> {
        let mut devices = self.devices.lock().await;
        let idx = devices.iter().position(|d| d.id == id)?;
        Some(devices.remove(idx))
    }

    /// Snapshot of connected devices for the broadcaster to iterate without
    /// holding the devices lock across an `.await` on each queue append.
    pub async fn device_snapshot(&self) -> Vec<Arc<ControlDevice>> {
        self.devices.lock().await.clone()
    }

    /// Inserts `port_id` into the put-queue, expiring `wait_ms` from now,
    /// and wakes the sweeper if this is now the earliest entry.
    pub async fn schedule_put(&self, port_id: u32, wait_ms: u64) {
        let expires_at = Instant::now() + Duration::from_millis(wait_ms);
        let mut q = self.put_queue.lock().await;
        let was_earliest = q.peek().map(|Reverse((t, _))| expires_at < *t).unwrap_or(true);
        q.push(Reverse((expires_at, port_id)));
        drop(q);
        if was_earliest {
            self.put_queue_notify.notify_waiters();
        }
    }

    /// Pops every entry whose expiration has passed, returning their
    /// port-ids. Called by the sweeper loop.
    async fn pop_expired(&self) -> Vec<u32> {
        let now = Instant::now();
        let mut q = self.put_queue.lock().await;
        let mut expired = Vec::new();
        while let Some(Reverse((t, _))) = q.peek() {
            if *t > now {
                break;
            }
            let Reverse((_, port_id)) = q.pop().unwrap();
            expired.push(port_id);
        }
        expired
    }

    /// Time until the earliest put-queue entry, or `None` if empty.
    async fn next_deadline(&self) -> Option<Instant> {
        self.put_queue.lock().await.peek().map(|Reverse((t, _))| *t)
    }

    /// Runs the put-queue timer loop forever, invoking `on_expire` for each
    /// port-id whose grace period elapsed (mirrors `flows_putq_tmr` firing
    /// into a work item, §4.D/§9). Intended to be spawned once per `Dm` via
    /// `tokio::spawn` and aborted on DM teardown.
    pub async fn run_sweeper<F, Fut>(self: Arc<Self>, on_expire: F)
    where
        F: Fn(Arc<Self>, u32) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            let deadline = self.next_deadline().await;
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at.into()) => {}
                        _ = self.put_queue_notify.notified() => {}
                    }
                }
                None => self.put_queue_notify.notified().await,
            }
            for port_id in self.pop_expired().await {
                on_expire(self.clone(), port_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweeper_fires_once_wait_elapses() {
        let dm = Dm::new("ns");
        dm.schedule_put(7, 10).await;

        let fired = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let fired2 = fired.clone();
        let handle = tokio::spawn(dm.clone().run_sweeper(move |_dm, port_id| {
            let fired = fired2.clone();
            async move {
                fired.lock().await.push(port_id);
            }
        }));

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.abort();
        assert_eq!(*fired.lock().await, vec![7]);
    }

    #[tokio::test]
    async fn uid_counter_is_monotonic() {
        let dm = Dm::new("ns");
        let a = dm.next_uid();
        let b = dm.next_uid();
        assert!(b > a);
    }
}
