//! IPCP table and object (§3, §4.C, §4.D IPCP half).

use crate::dif::Dif;
use crate::factory::Factory;
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

bitflags! {
    /// IPCP state flags (§3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpcpFlags: u32 {
        /// Marked for destruction: accepts no new flows or registrations
        /// and is invisible to DIF selection.
        const ZOMBIE = 0x1;
        /// Flows on this IPCP carry connection-endpoint ids.
        const USE_CEP_IDS = 0x2;
    }
}

/// Additive per-CPU statistics counters (§9 "Per-CPU statistics").
///
/// Each logical CPU gets its own cache-line-ish counter set so writers never
/// contend; `aggregate()` sums across CPUs with no lock, accepting torn
/// reads on 32-bit platforms as the spec notes is acceptable for
/// monitoring-only data.
#[derive(Default)]
pub struct PerCpuStats {
    tx_pdus: Vec<AtomicU64>,
    rx_pdus: Vec<AtomicU64>,
    tx_bytes: Vec<AtomicU64>,
    rx_bytes: Vec<AtomicU64>,
}

/// Point-in-time aggregate of `PerCpuStats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub tx_pdus: u64,
    pub rx_pdus: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

impl PerCpuStats {
    pub fn new() -> Self {
        let n = num_cpus::get().max(1);
        Self {
            tx_pdus: (0..n).map(|_| AtomicU64::new(0)).collect(),
            rx_pdus: (0..n).map(|_| AtomicU64::new(0)).collect(),
            tx_bytes: (0..n).map(|_| AtomicU64::new(0)).collect(),
            rx_bytes: (0..n).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn slot() -> usize {
        // There is no stable "current CPU" id in safe user-space Rust;
        // a thread-local counter spreads writers across slots well enough
        // for monitoring purposes without pulling in a platform crate.
        thread_local!(static SLOT: std::cell::Cell<usize> = const { std::cell::Cell::new(usize::MAX) });
        SLOT.with(|s| {
            if s.get() == usize::MAX {
                s.set(rand::random::<usize>());
            }
            s.get()
        })
    }

    pub fn add_tx(&self, pdus: u64, bytes: u64) {
        let i = Self::slot() % self.tx_pdus.len();
        self.tx_pdus[i].fetch_add(pdus, Ordering::Relaxed);
        self.tx_bytes[i].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_rx(&self, pdus: u64, bytes: u64) {
        let i = Self::slot() % self.rx_pdus.len();
        self.rx_pdus[i].fetch_add(pdus, Ordering::Relaxed);
        self.rx_bytes[i].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn aggregate(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_pdus: self.tx_pdus.iter().map(|c| c.load(Ordering::Relaxed)).sum(),
            rx_pdus: self.rx_pdus.iter().map(|c| c.load(Ordering::Relaxed)).sum(),
            tx_bytes: self.tx_bytes.iter().map(|c| c.load(Ordering::Relaxed)).sum(),
            rx_bytes: self.rx_bytes.iter().map(|c| c.load(Ordering::Relaxed)).sum(),
        }
    }
}

/// A named IPC Process (§3).
pub struct Ipcp {
    pub id: u16,
    pub name: String,
    pub dif: Arc<Dif>,
    pub factory: Arc<dyn Factory>,
    pub address: parking_lot::Mutex<Option<u64>>,
    pub txhdroom: parking_lot::Mutex<u32>,
    pub rxhdroom: parking_lot::Mutex<u32>,
    pub max_sdu_size: parking_lot::Mutex<u32>,
    pub flow_del_wait_ms: parking_lot::Mutex<u64>,
    pub stats: PerCpuStats,
    pub registered_appls: parking_lot::Mutex<Vec<String>>,
    pub uipcp: parking_lot::Mutex<Option<u64>>,
    pub flags: parking_lot::Mutex<IpcpFlags>,
    refcnt: AtomicU64,
}

/// Default per-IPCP grace period before a deallocated flow is finally torn
/// down (§4.D, "default 4000 ms").
pub const FLOW_DEL_WAIT_MS_DEFAULT: u64 = 4000;

impl Ipcp {
    pub fn new(id: u16, name: String, dif: Arc<Dif>, factory: Arc<dyn Factory>) -> Arc<Self> {
        let flags = if factory.use_cep_ids() {
            IpcpFlags::USE_CEP_IDS
        } else {
            IpcpFlags::empty()
        };
        Arc::new(Self {
            id,
            name,
            dif,
            factory,
            address: parking_lot::Mutex::new(None),
            txhdroom: parking_lot::Mutex::new(0),
            rxhdroom: parking_lot::Mutex::new(0),
            max_sdu_size: parking_lot::Mutex::new(8992),
            flow_del_wait_ms: parking_lot::Mutex::new(FLOW_DEL_WAIT_MS_DEFAULT),
            stats: PerCpuStats::new(),
            registered_appls: parking_lot::Mutex::new(Vec::new()),
            uipcp: parking_lot::Mutex::new(None),
            flags: parking_lot::Mutex::new(flags),
            refcnt: AtomicU64::new(1),
        })
    }

    pub fn is_zombie(&self) -> bool {
        self.flags.lock().contains(IpcpFlags::ZOMBIE)
    }

    pub fn use_cep_ids(&self) -> bool {
        self.flags.lock().contains(IpcpFlags::USE_CEP_IDS)
    }

    pub fn mark_zombie(&self) {
        self.flags.lock().insert(IpcpFlags::ZOMBIE);
    }

    /// Atomically bumps the logical refcount; called whenever a lookup
    /// hands this IPCP to a new owner (§4.C: "atomically increment its
    /// refcount").
    pub fn get_ref(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one reference, returning true iff this was the last one.
    /// The caller (`IpcpTable::put`) is responsible for unlinking under the
    /// table lock before the count can reach zero, per the double-free
    /// guard in §4.D.
    pub fn put_ref(&self) -> bool {
        self.refcnt.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn refcount(&self) -> u64 {
        self.refcnt.load(Ordering::Acquire)
    }
}

/// Hash table + bitmap allocator for IPCPs within one DM (§4.C).
pub struct IpcpTable {
    pub bitmap: crate::ids::IdBitmap,
    entries: HashMap<u16, Arc<Ipcp>>,
}

impl IpcpTable {
    pub fn new() -> Self {
        Self {
            bitmap: crate::ids::IdBitmap::new(crate::ids::IdBitmap::IPCP_CAPACITY),
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, ipcp: Arc<Ipcp>) {
        self.entries.insert(ipcp.id, ipcp);
    }

    /// Looks up by id, bumping the refcount of a found entry.
    pub fn get(&self, id: u16) -> Option<Arc<Ipcp>> {
        self.entries.get(&id).map(|ipcp| {
            ipcp.get_ref();
            ipcp.clone()
        })
    }

    /// Selects an IPCP by DIF name (§4.C "IPCP selection by DIF"). Zombie
    /// entries are invisible. When `dif_name` is `None`, picks any
    /// non-zombie IPCP, preferring a "normal" DIF type and the largest
    /// `txhdroom` to break ties toward the deepest available stack.
    pub fn select_by_dif(&self, dif_name: Option<&str>) -> Option<Arc<Ipcp>> {
        let candidates = self.entries.values().filter(|e| !e.is_zombie());

        let selected = if let Some(name) = dif_name {
            candidates.filter(|e| e.dif.name == name).max_by_key(|e| *e.txhdroom.lock())
        } else {
            candidates.max_by_key(|e| {
                let normal_bonus = if e.dif.ty == "normal" { 1u64 << 32 } else { 0 };
                normal_bonus + *e.txhdroom.lock() as u64
            })
        };

        selected.map(|ipcp| {
            ipcp.get_ref();
            ipcp.clone()
        })
    }

    pub fn name_exists(&self, name: &str) -> bool {
        self.entries.values().any(|e| e.name == name)
    }

    /// Unlinks the entry from the table and bitmap. Called only once the
    /// caller has observed the refcount drop to zero under this table's
    /// lock (§4.D IPCP put).
    pub fn unlink(&mut self, id: u16) -> Option<Arc<Ipcp>> {
        let ipcp = self.entries.remove(&id);
        if ipcp.is_some() {
            self.bitmap.free(id as u32);
        }
        ipcp
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Ipcp>> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::NullIpcpFactory;

    fn mk(id: u16, name: &str, dif_name: &str, dif_ty: &str) -> Arc<Ipcp> {
        let dif = Arc::new(Dif {
            name: dif_name.to_string(),
            ty: dif_ty.to_string(),
            max_pdu_life_ms: 2000,
        });
        Ipcp::new(id, name.to_string(), dif, NullIpcpFactory::new(dif_ty))
    }

    #[test]
    fn zombie_ipcp_is_invisible_to_dif_selection() {
        let mut t = IpcpTable::new();
        let a = mk(0, "a", "d1", "normal");
        a.mark_zombie();
        t.insert(a);
        assert!(t.select_by_dif(Some("d1")).is_none());
    }

    #[test]
    fn selection_prefers_normal_type_when_no_dif_given() {
        let mut t = IpcpTable::new();
        t.insert(mk(0, "shim0", "d1", "shim-eth"));
        t.insert(mk(1, "normal0", "d2", "normal"));
        let picked = t.select_by_dif(None).unwrap();
        assert_eq!(picked.id, 1);
    }

    #[test]
    fn refcount_reaches_zero_exactly_once() {
        let ipcp = mk(0, "a", "d1", "normal");
        ipcp.get_ref();
        assert!(!ipcp.put_ref());
        assert!(ipcp.put_ref());
    }
}
