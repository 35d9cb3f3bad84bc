//! Flow allocation state machine (§4.G).
//!
//! Implements the four FA_* events as free functions over a `Dm`, each
//! returning the outbound message(s) the caller (the dispatcher) should
//! enqueue — to whom depends on whether the target IPCP answered the hook
//! itself (`SyncOutcome`) or has a uipcp attached, so these functions leave
//! delivery to the caller rather than reaching into the device list
//! themselves.

use crate::control_device::ControlDevice;
use crate::dm::Dm;
use crate::error::{Error, Result};
use crate::factory::SyncOutcome;
use crate::flow::Flow;
use crate::ipcp::Ipcp;
use crate::message::{ApplName, Body, FlowSpec};
use std::sync::Arc;

/// Outcome of `fa_req`: either the request was answered synchronously by
/// the IPCP's own factory, or it must be reflected to `uipcp_id`'s control
/// device as a plain `FA_REQ`-shaped notification.
pub enum FaReqOutcome {
    /// The kernel-side factory accepted or refused synchronously.
    Synchronous { accepted: bool, flow: Arc<Flow> },
    /// No kernel-side hook; forward to the IPCP's attached uipcp.
    ReflectToUipcp { flow: Arc<Flow> },
}

/// FA_REQ (§4.G step 1). `dif_name` selects the IPCP (or any non-zombie
/// IPCP if absent); a flow is always allocated up front in
/// `PENDING|NEVER_BOUND|INITIATOR` even if it ends up being synchronously
/// refused, since the caller needs *a* flow object to carry the negative
/// result back through and onto the put-queue.
pub async fn fa_req(
    dm: &Arc<Dm>,
    dif_name: Option<&str>,
    local_appl: ApplName,
    remote_appl: ApplName,
    spec: FlowSpec,
    requester_device_id: u64,
    requester_event_id: u32,
) -> Result<(Arc<Ipcp>, FaReqOutcome)> {
    let ipcp = {
        let ipcps = dm.ipcps.lock().await;
        ipcps
            .select_by_dif(dif_name)
            .ok_or_else(|| Error::NoDevice("no IPCP available for requested DIF".into()))?
    };

    let port_id = {
        let mut flows = dm.flows.write().await;
        let port_id = flows.port_bitmap.alloc()?;
        let uid = dm.next_uid();
        let flow = Flow::new(port_id, ipcp.id, local_appl.clone(), remote_appl.clone(), spec.clone(), uid, true);
        *flow.owner_device.lock() = Some(requester_device_id);
        *flow.owner_event_id.lock() = Some(requester_event_id);
        flows.insert(flow);
        port_id
    };
    let flow = dm.flows.read().await.get(port_id).expect("just inserted");
    // Unbound-flow sweep (§9): reclaimed if nothing ever calls
    // `flow_make_mortal` on it (the application never takes ownership).
    dm.schedule_put(port_id, crate::dm::UNBOUND_FLOW_TIMEOUT_MS).await;

    let outcome = ipcp
        .factory
        .flow_allocate_req(ipcp.id, &local_appl, &remote_appl, &spec)
        .await;

    match outcome {
        SyncOutcome::NotImplemented => {
            if ipcp.uipcp.lock().is_none() {
                // No kernel hook and no uipcp: fail fast, negative
                // FA_RESP_ARRIVED is synthesized by the caller (§4.G step 1).
                flow.rollback_unbound();
                return Err(Error::NoDevice(
                    "IPCP has neither a kernel flow_allocate_req hook nor an attached uipcp".into(),
                ));
            }
            Ok((ipcp, FaReqOutcome::ReflectToUipcp { flow }))
        }
        SyncOutcome::Accepted => {
            flow.mark_allocated(None);
            crate::lifecycle::flow_make_mortal(dm, port_id).await;
            Ok((ipcp, FaReqOutcome::Synchronous { accepted: true, flow }))
        }
        SyncOutcome::Refused => {
            flow.rollback_unbound();
            Ok((ipcp, FaReqOutcome::Synchronous { accepted: false, flow }))
        }
    }
}

/// FA_REQ_ARRIVED (§4.G step 2), triggered by the IPCP layer (kernel or
/// uipcp). Allocates the server-side flow and overwrites its `uid` with the
/// uipcp-chosen `kevent_id` so later FA_RESP/FA_RESP_ARRIVED can be matched
/// back to this allocation. The caller is responsible for checking that
/// `local_appl` is actually registered on `ipcp_id` before calling this (it
/// needs the per-IPCP `AppRegistry` to do that, which only the dispatcher
/// holds a lock on).
pub async fn fa_req_arrived(
    dm: &Arc<Dm>,
    ipcp_id: u16,
    local_appl: ApplName,
    remote_appl: ApplName,
    remote_port: u32,
    remote_cep: Option<u32>,
    remote_addr: u64,
    kevent_id: u32,
    spec: FlowSpec,
) -> Result<Arc<Flow>> {
    let mut flows = dm.flows.write().await;
    let port_id = flows.port_bitmap.alloc()?;
    let flow = Flow::new(port_id, ipcp_id, local_appl, remote_appl, spec, kevent_id, false);
    *flow.remote_port.lock() = Some(remote_port);
    *flow.remote_cep.lock() = remote_cep;
    *flow.remote_addr.lock() = Some(remote_addr);
    flows.insert(flow.clone());
    drop(flows);
    // Unbound-flow sweep (§9): reclaimed if the server-side application
    // never calls `flow_make_mortal` on it.
    dm.schedule_put(port_id, crate::dm::UNBOUND_FLOW_TIMEOUT_MS).await;
    Ok(flow)
}

/// FA_RESP (§4.G step 3): the server side answers a pending flow it was
/// told about via FA_REQ_ARRIVED. `kevent_id` must match the flow's `uid`
/// (defends against port-id reuse); on accept, transitions to ALLOCATED and
/// optionally binds `upper_ipcp_id`, rolling back to DEALLOCATED
/// (§9 Open Question a) if that bind fails.
pub async fn fa_resp(
    dm: &Arc<Dm>,
    port_id: u32,
    kevent_id: u32,
    accept: bool,
    upper_ipcp_id: Option<u16>,
) -> Result<Arc<Flow>> {
    let flow = {
        let flows = dm.flows.read().await;
        flows
            .get(port_id)
            .ok_or_else(|| Error::NoDevice(format!("no such flow: port {port_id}")))?
    };

    if !flow.is_pending() {
        return Err(Error::Invalid(format!("flow {port_id} is not PENDING")));
    }
    if flow.uid != kevent_id {
        return Err(Error::Invalid("kevent_id does not match flow uid".into()));
    }

    if !accept {
        flow.rollback_unbound();
        return Ok(flow);
    }

    if let Some(upper_id) = upper_ipcp_id {
        let bound = dm.ipcps.lock().await.get(upper_id).is_some();
        if !bound {
            // Upper-IPCP bind failed: roll the flow back rather than leave
            // it ALLOCATED with a dangling upper binding (§9 Open Question a).
            flow.rollback_unbound();
            return Err(Error::Invalid(format!(
                "upper IPCP {upper_id} does not exist; flow {port_id} rolled back"
            )));
        }
    }

    flow.mark_allocated(upper_ipcp_id);
    crate::lifecycle::flow_make_mortal(dm, port_id).await;
    Ok(flow)
}

/// FA_RESP_ARRIVED (§4.G step 4): applies the same matching/state checks to
/// the client-side flow. On accept the caller should deliver a
/// `FA_RESP_ARRIVED` upstream message; on refusal or error the flow is
/// removed from the put-queue (it was never allocated) and released
/// immediately.
pub async fn fa_resp_arrived(
    dm: &Arc<Dm>,
    port_id: u32,
    kevent_id: u32,
    accept: bool,
) -> Result<Arc<Flow>> {
    let flow = {
        let flows = dm.flows.read().await;
        flows
            .get(port_id)
            .ok_or_else(|| Error::NoDevice(format!("no such flow: port {port_id}")))?
    };
    if !flow.is_pending() {
        return Err(Error::Invalid(format!("flow {port_id} is not PENDING")));
    }
    if flow.uid != kevent_id {
        return Err(Error::Invalid("kevent_id does not match flow uid".into()));
    }

    if accept {
        flow.mark_allocated(None);
        crate::lifecycle::flow_make_mortal(dm, port_id).await;
    } else {
        flow.rollback_unbound();
        dm.flows.write().await.remove(port_id);
    }
    Ok(flow)
}

/// Builds the `FA_RESP_ARRIVED` body delivered to the client's control
/// device, matching `response` to Rust's bool semantics (0 = accepted).
pub fn fa_resp_arrived_body(event_id: u32, flow: &Flow, accepted: bool) -> (u32, Body) {
    (
        event_id,
        Body::FaRespArrived {
            port_id: flow.port_id,
            response: if accepted { 0 } else { 1 },
        },
    )
}

/// Owner (control device) that should receive async notifications for a
/// registered application, resolved outside this module's responsibility
/// (kept here only as a type alias documenting the data threaded through).
pub type NotifyTarget = Arc<ControlDevice>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dif::Dif;
    use crate::factory::NullIpcpFactory;

    async fn setup_ipcp(dm: &Arc<Dm>) -> Arc<Ipcp> {
        let dif = Arc::new(Dif {
            name: "d1".into(),
            ty: "normal".into(),
            max_pdu_life_ms: 2000,
        });
        let ipcp = Ipcp::new(0, "n.A".into(), dif, NullIpcpFactory::new("normal"));
        dm.ipcps.lock().await.insert(ipcp.clone());
        ipcp
    }

    #[tokio::test]
    async fn fa_req_without_uipcp_or_hook_fails_no_device() {
        let dm = Dm::new("ns");
        setup_ipcp(&dm).await;
        let result = fa_req(&dm, Some("d1"), ApplName::new("cli"), ApplName::new("srv"), FlowSpec::default(), 1, 7).await;
        assert!(matches!(result, Err(Error::NoDevice(_))));
    }

    #[tokio::test]
    async fn fa_req_reflects_when_uipcp_is_attached() {
        let dm = Dm::new("ns");
        let ipcp = setup_ipcp(&dm).await;
        *ipcp.uipcp.lock() = Some(1);

        let (_, outcome) = fa_req(&dm, Some("d1"), ApplName::new("cli"), ApplName::new("srv"), FlowSpec::default(), 1, 7)
            .await
            .unwrap();
        assert!(matches!(outcome, FaReqOutcome::ReflectToUipcp { .. }));
    }

    #[tokio::test]
    async fn fa_resp_mismatched_kevent_is_rejected() {
        let dm = Dm::new("ns");
        let flow = fa_req_arrived(
            &dm, 0, ApplName::new("srv"), ApplName::new("cli"), 9, None, 100, 55, FlowSpec::default(),
        )
        .await
        .unwrap();
        let result = fa_resp(&dm, flow.port_id, 999, true, None).await;
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[tokio::test]
    async fn fa_resp_accept_transitions_to_allocated() {
        let dm = Dm::new("ns");
        let flow = fa_req_arrived(
            &dm, 0, ApplName::new("srv"), ApplName::new("cli"), 9, None, 100, 55, FlowSpec::default(),
        )
        .await
        .unwrap();
        let flow = fa_resp(&dm, flow.port_id, 55, true, None).await.unwrap();
        assert!(flow.is_allocated());
    }

    #[tokio::test]
    async fn fa_resp_bind_to_missing_upper_ipcp_rolls_back() {
        let dm = Dm::new("ns");
        let flow = fa_req_arrived(
            &dm, 0, ApplName::new("srv"), ApplName::new("cli"), 9, None, 100, 55, FlowSpec::default(),
        )
        .await
        .unwrap();
        let result = fa_resp(&dm, flow.port_id, 55, true, Some(77)).await;
        assert!(result.is_err());
        assert!(flow.is_deallocated());
        assert!(!flow.is_allocated());
    }
}
