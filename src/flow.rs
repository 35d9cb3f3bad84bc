//! Flow object and per-DM flow tables (§3, §4.C flow half, §4.G).

use crate::message::{ApplName, FlowSpec};
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

bitflags! {
    /// Flow state flags (§3, §4.G).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlowFlags: u32 {
        /// FA_REQ sent/arrived, awaiting FA_RESP.
        const PENDING = 0x1;
        /// FA_RESP accepted; data-carrying state.
        const ALLOCATED = 0x2;
        /// FLOW_DEALLOC issued or remote deallocation observed; queued for
        /// final teardown after the grace period.
        const DEALLOCATED = 0x4;
        /// Created but never bound to an upper IPCP/application
        /// (rollback target for a failed FA_RESP accept, §9 Open Question a).
        const NEVER_BOUND = 0x8;
        /// Final teardown postponed because in-flight SDUs may still be
        /// draining (§4.D, mirrors `FLOW_DEL_POSTPONED`).
        const DEL_POSTPONED = 0x10;
        /// This endpoint issued the original FA_REQ (vs. the arrived side).
        const INITIATOR = 0x20;
    }
}

/// A single allocated (or being-allocated) flow.
pub struct Flow {
    pub port_id: u32,
    pub cep_id: parking_lot::Mutex<Option<u32>>,
    pub ipcp_id: u16,
    pub local_appl: ApplName,
    pub remote_appl: ApplName,
    pub remote_port: parking_lot::Mutex<Option<u32>>,
    pub remote_cep: parking_lot::Mutex<Option<u32>>,
    pub remote_addr: parking_lot::Mutex<Option<u64>>,
    pub qos_id: parking_lot::Mutex<Option<u32>>,
    pub uid: u32,
    pub spec: FlowSpec,
    pub upper_ipcp_id: parking_lot::Mutex<Option<u16>>,
    pub flags: parking_lot::Mutex<FlowFlags>,
    /// Set when `DEALLOCATED` is raised; consulted by the put-queue sweep
    /// to decide whether `flow_del_wait_ms` has elapsed (§4.D).
    pub deallocated_at: parking_lot::Mutex<Option<Instant>>,
    /// Control device that issued the original FA_REQ for this flow, if any
    /// (unset on the arrived/server side). Used to route the eventual
    /// FA_RESP_ARRIVED back to the right connection once a uipcp answers
    /// asynchronously (§4.G step 4).
    pub owner_device: parking_lot::Mutex<Option<u64>>,
    /// `event_id` of the original FA_REQ, echoed back on the FA_RESP_ARRIVED
    /// that eventually answers it.
    pub owner_event_id: parking_lot::Mutex<Option<u32>>,
}

impl Flow {
    pub fn new(
        port_id: u32,
        ipcp_id: u16,
        local_appl: ApplName,
        remote_appl: ApplName,
        spec: FlowSpec,
        uid: u32,
        initiator: bool,
    ) -> Arc<Self> {
        let mut flags = FlowFlags::PENDING | FlowFlags::NEVER_BOUND;
        if initiator {
            flags |= FlowFlags::INITIATOR;
        }
        Arc::new(Self {
            port_id,
            cep_id: parking_lot::Mutex::new(None),
            ipcp_id,
            local_appl,
            remote_appl,
            remote_port: parking_lot::Mutex::new(None),
            remote_cep: parking_lot::Mutex::new(None),
            remote_addr: parking_lot::Mutex::new(None),
            qos_id: parking_lot::Mutex::new(None),
            uid,
            spec,
            upper_ipcp_id: parking_lot::Mutex::new(None),
            flags: parking_lot::Mutex::new(flags),
            deallocated_at: parking_lot::Mutex::new(None),
            owner_device: parking_lot::Mutex::new(None),
            owner_event_id: parking_lot::Mutex::new(None),
        })
    }

    pub fn is_pending(&self) -> bool {
        self.flags.lock().contains(FlowFlags::PENDING)
    }

    pub fn is_allocated(&self) -> bool {
        self.flags.lock().contains(FlowFlags::ALLOCATED)
    }

    pub fn is_deallocated(&self) -> bool {
        self.flags.lock().contains(FlowFlags::DEALLOCATED)
    }

    /// Transitions PENDING -> ALLOCATED on a successful FA_RESP, clearing
    /// NEVER_BOUND once an upper IPCP/application is bound.
    pub fn mark_allocated(&self, upper_ipcp_id: Option<u16>) {
        let mut flags = self.flags.lock();
        flags.remove(FlowFlags::PENDING);
        flags.insert(FlowFlags::ALLOCATED);
        if upper_ipcp_id.is_some() {
            flags.remove(FlowFlags::NEVER_BOUND);
        }
        drop(flags);
        *self.upper_ipcp_id.lock() = upper_ipcp_id;
    }

    /// Rolls a flow that failed to bind its upper IPCP back to a deallocated,
    /// never-bound state so the sweep reclaims it without a data phase
    /// (§9 Open Question a: "the flow rolls back to Deallocated").
    pub fn rollback_unbound(&self) {
        let mut flags = self.flags.lock();
        flags.remove(FlowFlags::PENDING);
        flags.remove(FlowFlags::ALLOCATED);
        flags.insert(FlowFlags::DEALLOCATED);
        drop(flags);
        *self.deallocated_at.lock() = Some(Instant::now());
    }

    pub fn mark_deallocated(&self) {
        let mut flags = self.flags.lock();
        if flags.contains(FlowFlags::DEALLOCATED) {
            return;
        }
        flags.insert(FlowFlags::DEALLOCATED);
        drop(flags);
        *self.deallocated_at.lock() = Some(Instant::now());
    }
}

/// Per-DM flow tables, indexed by both port-id (primary key, client-facing)
/// and cep-id (only populated for IPCPs with `USE_CEP_IDS`, §3).
pub struct FlowTable {
    pub port_bitmap: crate::ids::IdBitmap,
    pub cep_bitmap: crate::ids::IdBitmap,
    by_port: HashMap<u32, Arc<Flow>>,
    by_cep: HashMap<u32, u32>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self {
            port_bitmap: crate::ids::IdBitmap::new(crate::ids::IdBitmap::PORT_CAPACITY),
            cep_bitmap: crate::ids::IdBitmap::new(crate::ids::IdBitmap::PORT_CAPACITY),
            by_port: HashMap::new(),
            by_cep: HashMap::new(),
        }
    }

    pub fn insert(&mut self, flow: Arc<Flow>) {
        if let Some(cep) = *flow.cep_id.lock() {
            self.by_cep.insert(cep, flow.port_id);
        }
        self.by_port.insert(flow.port_id, flow);
    }

    pub fn get(&self, port_id: u32) -> Option<Arc<Flow>> {
        self.by_port.get(&port_id).cloned()
    }

    pub fn get_by_cep(&self, cep_id: u32) -> Option<Arc<Flow>> {
        self.by_cep.get(&cep_id).and_then(|port| self.by_port.get(port)).cloned()
    }

    pub fn remove(&mut self, port_id: u32) -> Option<Arc<Flow>> {
        let flow = self.by_port.remove(&port_id);
        if let Some(flow) = &flow {
            self.port_bitmap.free(port_id);
            if let Some(cep) = *flow.cep_id.lock() {
                self.by_cep.remove(&cep);
                self.cep_bitmap.free(cep);
            }
        }
        flow
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Flow>> {
        self.by_port.values()
    }
}
