//! Namespace-keyed table of `Dm`s (§4.I).
//!
//! On first reference for a namespace a `Dm` is constructed and its
//! put-queue sweeper spawned; on last release the `Dm` is dropped and its
//! sweeper task aborted. The namespace key stands in for a Linux network
//! namespace handle, which user-space Rust cannot observe directly — tests
//! use distinct strings per isolation domain the way the kernel source
//! uses distinct `struct net *`.

use crate::dm::Dm;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct Entry {
    dm: Arc<Dm>,
    refcount: usize,
    sweeper: JoinHandle<()>,
}

/// Process-wide manager handing out refcounted `Dm` handles per namespace.
#[derive(Default)]
pub struct DataModelManager {
    entries: Mutex<HashMap<String, Entry>>,
}

impl DataModelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the `Dm` for `namespace`, creating and spawning its sweeper
    /// on first reference.
    pub async fn get_or_create(&self, namespace: &str) -> Arc<Dm> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(namespace) {
            entry.refcount += 1;
            return entry.dm.clone();
        }

        let dm = Dm::new(namespace);
        let sweeper = tokio::spawn(dm.clone().run_sweeper(|dm, port_id| async move {
            let notify_uipcp = crate::lifecycle::finish_flow_teardown(dm.clone(), port_id).await;
            if notify_uipcp {
                deliver_flow_deallocated(&dm, port_id).await;
            }
        }));
        entries.insert(
            namespace.to_string(),
            Entry {
                dm: dm.clone(),
                refcount: 1,
                sweeper,
            },
        );
        dm
    }

    /// Releases one reference to `namespace`'s `Dm`. On the last release the
    /// sweeper is aborted and the entry dropped (§4.I "drained... and the
    /// namespace reference dropped").
    pub async fn put(&self, namespace: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(namespace) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                let entry = entries.remove(namespace).unwrap();
                entry.sweeper.abort();
            }
        }
    }
}

/// Finds the uipcp attached to a torn-down flow's IPCP and enqueues
/// `FLOW_DEALLOCATED` (§4.D step 2's notification clause).
async fn deliver_flow_deallocated(dm: &Arc<Dm>, port_id: u32) {
    let ipcp_id = {
        let flows = dm.flows.read().await;
        flows.get(port_id).map(|f| f.ipcp_id)
    };
    let Some(ipcp_id) = ipcp_id else { return };
    let uipcp_id = dm.ipcps.lock().await.get(ipcp_id).and_then(|ipcp| *ipcp.uipcp.lock());
    let Some(uipcp_id) = uipcp_id else { return };

    let device = dm.devices.lock().await.iter().find(|d| d.id == uipcp_id).cloned();
    if let Some(device) = device {
        let msg = crate::message::CtrlMessage::new(
            crate::message::MsgType::FlowDeallocated,
            0,
            crate::message::Body::FlowDeallocated { port_id },
        );
        let _ = device.upstream.append(&msg, false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn distinct_namespaces_get_distinct_dms() {
        let mgr = DataModelManager::new();
        let a = mgr.get_or_create("ns-a").await;
        let b = mgr.get_or_create("ns-b").await;
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn same_namespace_reuses_the_dm_and_bumps_refcount() {
        let mgr = DataModelManager::new();
        let a = mgr.get_or_create("ns-a").await;
        let a2 = mgr.get_or_create("ns-a").await;
        assert!(Arc::ptr_eq(&a, &a2));
        mgr.put("ns-a").await;
        mgr.put("ns-a").await;
        assert!(mgr.entries.lock().await.get("ns-a").is_none());
    }
}
