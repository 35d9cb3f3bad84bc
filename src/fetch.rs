//! Stateful fetch cursors for `FLOW_FETCH`/`REG_FETCH` (§4.J).
//!
//! Each control device owns one cursor per enumeration kind. The contract:
//! if the cursor is empty, snapshot the current table into the cursor (one
//! queued entry per match, plus a terminator), *then* pop and return the
//! head — so every `*_FETCH` request, including the one that triggers the
//! snapshot, returns exactly one entry.

use crate::message::{ApplName, Body};
use std::collections::VecDeque;
use std::sync::Mutex;

/// One flow-table row as handed to the cursor by the caller (built from a
/// point-in-time read of the DM's flow table).
pub struct FlowRow {
    pub port_id: u32,
    pub local_appl: ApplName,
    pub remote_appl: ApplName,
    pub ipcp_id: u16,
}

/// One registration-table row.
pub struct RegRow {
    pub appl_name: ApplName,
    pub ipcp_id: u16,
    pub pending: bool,
}

#[derive(Default)]
pub struct FetchCursors {
    flow_queue: Mutex<VecDeque<Body>>,
    reg_queue: Mutex<VecDeque<Body>>,
}

impl FetchCursors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Services one `FLOW_FETCH`. `snapshot` is consulted only when the
    /// cursor is currently empty.
    pub fn flow_fetch(&self, snapshot: impl FnOnce() -> Vec<FlowRow>) -> Body {
        let mut q = self.flow_queue.lock().unwrap();
        if q.is_empty() {
            for row in snapshot() {
                q.push_back(Body::FlowFetchResp {
                    end: false,
                    port_id: row.port_id,
                    local_appl: row.local_appl,
                    remote_appl: row.remote_appl,
                    ipcp_id: row.ipcp_id,
                });
            }
            q.push_back(Body::FlowFetchResp {
                end: true,
                port_id: 0,
                local_appl: ApplName::default(),
                remote_appl: ApplName::default(),
                ipcp_id: 0,
            });
        }
        q.pop_front().expect("terminator guarantees non-empty cursor")
    }

    /// Services one `REG_FETCH`, identical contract to `flow_fetch`.
    pub fn reg_fetch(&self, snapshot: impl FnOnce() -> Vec<RegRow>) -> Body {
        let mut q = self.reg_queue.lock().unwrap();
        if q.is_empty() {
            for row in snapshot() {
                q.push_back(Body::RegFetchResp {
                    end: false,
                    appl_name: row.appl_name,
                    ipcp_id: row.ipcp_id,
                    pending: row.pending,
                });
            }
            q.push_back(Body::RegFetchResp {
                end: true,
                appl_name: ApplName::default(),
                ipcp_id: 0,
                pending: false,
            });
        }
        q.pop_front().expect("terminator guarantees non-empty cursor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successive_fetches_walk_the_snapshot_then_terminate() {
        let c = FetchCursors::new();
        let rows = vec![
            FlowRow { port_id: 1, local_appl: ApplName::new("a"), remote_appl: ApplName::new("b"), ipcp_id: 0 },
            FlowRow { port_id: 2, local_appl: ApplName::new("c"), remote_appl: ApplName::new("d"), ipcp_id: 0 },
        ];
        let mut rows = Some(rows);
        let snap = move || rows.take().unwrap();

        let first = c.flow_fetch(snap);
        assert!(matches!(first, Body::FlowFetchResp { end: false, port_id: 1, .. }));

        let second = c.flow_fetch(|| panic!("snapshot must not be retaken mid-cursor"));
        assert!(matches!(second, Body::FlowFetchResp { end: false, port_id: 2, .. }));

        let third = c.flow_fetch(|| panic!("snapshot must not be retaken mid-cursor"));
        assert!(matches!(third, Body::FlowFetchResp { end: true, .. }));
    }

    #[test]
    fn empty_snapshot_still_yields_a_terminator() {
        let c = FetchCursors::new();
        let only = c.flow_fetch(Vec::new);
        assert!(matches!(only, Body::FlowFetchResp { end: true, .. }));
    }
}
