//! Reference-counted object lifecycle with deferred destruction (§4.D).

use crate::broadcaster;
use crate::dm::Dm;
use crate::flow::FlowFlags;
use crate::ipcp::Ipcp;
use crate::message::UpdateKind;
use std::sync::Arc;
use tracing::{info, warn};

/// Releases one reference on `ipcp`. If this was the last one, unlinks it
/// from the table and runs the (async, lock-free) teardown: factory
/// destructor, DIF release, IPCP-DELETE broadcast (§4.D "IPCP put").
pub async fn ipcp_put(dm: &Arc<Dm>, ipcp: Arc<Ipcp>) {
    let last = ipcp.put_ref();
    if !last {
        return;
    }

    {
        let mut table = dm.ipcps.lock().await;
        table.unlink(ipcp.id);
    }

    ipcp.factory.destroy(ipcp.id).await;
    dm.difs.lock().await.put(&ipcp.dif.name);

    let devices = dm.device_snapshot().await;
    broadcaster::broadcast(&devices, UpdateKind::Del, &ipcp).await;
    info!(ipcp_id = ipcp.id, name = %ipcp.name, "ipcp destroyed");
}

/// Marks `ipcp` ZOMBIE and broadcasts `UIPCP_DEL` so attached uipcps drop
/// their shadow state, without yet releasing the table's own reference
/// (the caller still holds the reference the `IPCP_DESTROY` handler took
/// from the table lookup, and must `ipcp_put` it itself, §4.D).
pub async fn ipcp_mark_zombie(dm: &Arc<Dm>, ipcp: &Arc<Ipcp>) {
    ipcp.mark_zombie();
    let devices = dm.device_snapshot().await;
    broadcaster::broadcast_uipcp_del(&devices, ipcp).await;
}

/// Clears the "never bound" unbound-flow timeout (§3 invariant iv, §9).
/// The application opening the flow's I/O device is out of scope (§1), so
/// the in-scope proxy for "an application took ownership of this flow" is
/// the flow reaching ALLOCATED under a control device or upper IPCP — the
/// three `flow_alloc` call sites where `mark_allocated` succeeds.
pub async fn flow_make_mortal(dm: &Arc<Dm>, port_id: u32) {
    let flows = dm.flows.read().await;
    if let Some(flow) = flows.get(port_id) {
        flow.flags.lock().remove(FlowFlags::NEVER_BOUND);
    }
}

/// First-stage flow release (§4.D "Flow put"): requests deallocation of
/// `port_id`. If the flow was ALLOCATED (a real, bound data-carrying flow),
/// it enters `DEALLOCATED|DEL_POSTPONED` and is scheduled onto the DM's
/// put-queue for `wait_ms`; a never-bound or already-pending flow is torn
/// down immediately since no datapath grace period is owed. Returns `false`
/// without side effects if the flow is already gone or already DEALLOCATED
/// (e.g. a concurrent `FLOW_DEALLOC` won the race), so the caller can tell a
/// real transition from a no-op (§8 scenario 3: "exactly one takes effect").
pub async fn flow_request_dealloc(dm: &Arc<Dm>, port_id: u32, wait_ms: u64) -> bool {
    let postpone = {
        let flows = dm.flows.read().await;
        let Some(flow) = flows.get(port_id) else {
            return false;
        };
        let mut flags = flow.flags.lock();
        if flags.contains(FlowFlags::DEALLOCATED) {
            return false;
        }
        let was_allocated = flags.contains(FlowFlags::ALLOCATED);
        let never_bound = flags.contains(FlowFlags::NEVER_BOUND);
        flags.remove(FlowFlags::ALLOCATED);
        flags.insert(FlowFlags::DEALLOCATED);
        let postpone = was_allocated && !never_bound;
        if postpone {
            flags.insert(FlowFlags::DEL_POSTPONED);
        }
        drop(flags);
        *flow.deallocated_at.lock() = Some(std::time::Instant::now());
        postpone
    };

    let wait = if postpone { wait_ms } else { 0 };
    dm.schedule_put(port_id, wait).await;
    true
}

/// Second-stage teardown, invoked by the DM's sweeper once a put-queue
/// entry's grace period has elapsed (§4.D step 2 / §9 unbound-flow sweep).
/// Unlinks the flow, invokes the owning IPCP's `flow_deallocated` hook, and
/// — if all of {local port, remote port, remote address} are valid —
/// notifies the uipcp with `FLOW_DEALLOCATED`. Actual uipcp delivery is the
/// caller's job (it has the control-device handle); this function performs
/// the table unlink and hook invocation and reports whether a notification
/// is owed.
///
/// A put-queue entry can fire for two reasons: a real deallocation grace
/// period elapsing, or the unbound-flow timeout scheduled at flow creation
/// (§9). The latter is a no-op if the flow was made mortal (`flow_make_mortal`
/// cleared NEVER_BOUND) and never deallocated in the meantime — that firing
/// is stale, superseded by the flow's ordinary lifecycle.
pub async fn finish_flow_teardown(dm: Arc<Dm>, port_id: u32) -> bool {
    {
        let flows = dm.flows.read().await;
        if let Some(flow) = flows.get(port_id) {
            let flags = *flow.flags.lock();
            if !flags.contains(FlowFlags::NEVER_BOUND) && !flags.contains(FlowFlags::DEALLOCATED) {
                return false;
            }
        }
    }

    let flow = {
        let mut flows = dm.flows.write().await;
        flows.remove(port_id)
    };
    let Some(flow) = flow else {
        warn!(port_id, "sweep fired for a flow that was already gone");
        return false;
    };
    flow.mark_deallocated();

    let ipcp = dm.ipcps.lock().await.get(flow.ipcp_id);
    if let Some(ipcp) = &ipcp {
        ipcp.factory.flow_deallocated(flow.ipcp_id, port_id).await;
        ipcp.put_ref();
    }

    let notify_uipcp = flow.remote_port.lock().is_some() && flow.remote_addr.lock().is_some();
    info!(port_id, ipcp_id = flow.ipcp_id, "flow torn down");
    notify_uipcp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dif::Dif;
    use crate::factory::NullIpcpFactory;
    use crate::flow::Flow;
    use crate::message::{ApplName, FlowSpec};

    fn mk_ipcp(dm_id: u16) -> Arc<Ipcp> {
        let dif = Arc::new(Dif {
            name: "d1".into(),
            ty: "normal".into(),
            max_pdu_life_ms: 2000,
        });
        Ipcp::new(dm_id, "n".into(), dif, NullIpcpFactory::new("normal"))
    }

    #[tokio::test]
    async fn allocated_flow_is_postponed_then_swept() {
        let dm = Dm::new("ns");
        let flow = Flow::new(
            1,
            0,
            ApplName::new("a"),
            ApplName::new("b"),
            FlowSpec::default(),
            dm.next_uid(),
            true,
        );
        flow.mark_allocated(None);
        dm.flows.write().await.insert(flow.clone());

        flow_request_dealloc(&dm, 1, 20).await;
        assert!(flow.flags.lock().contains(FlowFlags::DEL_POSTPONED));
        assert!(dm.flows.read().await.get(1).is_some());

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        // Not yet expired.
        assert!(dm.flows.read().await.get(1).is_some());
    }

    #[tokio::test]
    async fn never_bound_flow_tears_down_without_grace_period() {
        let dm = Dm::new("ns");
        let ipcp = mk_ipcp(0);
        dm.ipcps.lock().await.insert(ipcp.clone());

        let flow = Flow::new(
            2,
            0,
            ApplName::new("a"),
            ApplName::new("b"),
            FlowSpec::default(),
            dm.next_uid(),
            true,
        );
        dm.flows.write().await.insert(flow.clone());

        flow_request_dealloc(&dm, 2, 5000).await;
        assert!(!flow.flags.lock().contains(FlowFlags::DEL_POSTPONED));

        let removed = finish_flow_teardown(dm.clone(), 2).await;
        assert!(!removed);
        assert!(dm.flows.read().await.get(2).is_none());
    }

    /// §9 unbound-flow sweep: a flow left NEVER_BOUND is reclaimed once its
    /// scheduled entry fires.
    #[tokio::test]
    async fn never_made_mortal_flow_is_swept_by_unbound_timeout() {
        let dm = Dm::new("ns");
        let flow = Flow::new(
            3,
            0,
            ApplName::new("a"),
            ApplName::new("b"),
            FlowSpec::default(),
            dm.next_uid(),
            true,
        );
        dm.flows.write().await.insert(flow.clone());
        dm.schedule_put(3, 0).await;

        finish_flow_teardown(dm.clone(), 3).await;
        assert!(dm.flows.read().await.get(3).is_none());
    }

    /// A flow made mortal before its unbound-timeout entry fires is left
    /// alone — the firing is stale, superseded by `flow_make_mortal`.
    #[tokio::test]
    async fn flow_made_mortal_survives_its_unbound_timeout_entry() {
        let dm = Dm::new("ns");
        let flow = Flow::new(
            4,
            0,
            ApplName::new("a"),
            ApplName::new("b"),
            FlowSpec::default(),
            dm.next_uid(),
            true,
        );
        flow.mark_allocated(None);
        dm.flows.write().await.insert(flow.clone());
        dm.schedule_put(4, 0).await;

        flow_make_mortal(&dm, 4).await;
        assert!(!flow.flags.lock().contains(FlowFlags::NEVER_BOUND));

        let removed = finish_flow_teardown(dm.clone(), 4).await;
        assert!(!removed);
        assert!(dm.flows.read().await.get(4).is_some());
    }
}
