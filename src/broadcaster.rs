//! IPCP update broadcaster (§4.K).
//!
//! Subscription state lives on each `ControlDevice` itself
//! (`ControlDevice::is_subscribed`); this module only knows how to turn an
//! IPCP into an `IPCP_UPDATE` message and fan it out to a device list,
//! which keeps it decoupled from how the DM stores its device list.

use crate::control_device::ControlDevice;
use crate::ipcp::Ipcp;
use crate::message::{Body, MsgType, UpdateKind};
use std::sync::Arc;

fn update_body(kind: UpdateKind, ipcp: &Ipcp) -> Body {
    Body::IpcpUpdate {
        kind,
        ipcp_id: ipcp.id,
        dif_name: ipcp.dif.name.clone(),
        dif_type: ipcp.dif.ty.clone(),
        max_sdu_size: *ipcp.max_sdu_size.lock(),
    }
}

/// Notifies every subscribed device in `devices` of `kind` for `ipcp`.
/// Notifications use `may_block = false`: a lagging subscriber loses
/// updates rather than stalling the broadcaster (matches §4.B's queue
/// being the only backpressure mechanism — the broadcaster itself never
/// blocks on one slow reader).
pub async fn broadcast(devices: &[Arc<ControlDevice>], kind: UpdateKind, ipcp: &Ipcp) {
    let body = update_body(kind, ipcp);
    for device in devices {
        if !device.is_subscribed() {
            continue;
        }
        let msg = crate::message::CtrlMessage::new(MsgType::IpcpUpdate, 0, body.clone());
        let _ = device.upstream.append(&msg, false).await;
    }
}

/// Broadcasts `UIPCP_DEL` to every subscribed device when `ipcp` is marked
/// ZOMBIE, so attached uipcps can drop their shadow state (§4.K).
pub async fn broadcast_uipcp_del(devices: &[Arc<ControlDevice>], ipcp: &Ipcp) {
    broadcast(devices, UpdateKind::UipcpDel, ipcp).await;
}

/// Replays one `ADD` per currently-live IPCP to a device that just turned
/// its subscription on (§4.K "immediately enqueues one ADD for each
/// existing IPCP"). IPCPs are handed in table order; `ipcps` should already
/// exclude zombies (the caller filters, since only the IPCP table knows
/// which entries are visible).
pub async fn replay_subscription(device: &Arc<ControlDevice>, ipcps: &[Arc<Ipcp>]) {
    for ipcp in ipcps {
        let body = update_body(UpdateKind::Add, ipcp);
        let msg = crate::message::CtrlMessage::new(MsgType::IpcpUpdate, 0, body);
        let _ = device.upstream.append(&msg, false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dif::Dif;
    use crate::factory::NullIpcpFactory;

    fn mk_ipcp(id: u16) -> Arc<Ipcp> {
        let dif = Arc::new(Dif {
            name: "d1".into(),
            ty: "normal".into(),
            max_pdu_life_ms: 2000,
        });
        Ipcp::new(id, format!("n{id}"), dif, NullIpcpFactory::new("normal"))
    }

    #[tokio::test]
    async fn only_subscribed_devices_receive_updates() {
        let d1 = Arc::new(ControlDevice::new("ns"));
        let d2 = Arc::new(ControlDevice::new("ns"));
        d1.set_subscribed(true);
        let ipcp = mk_ipcp(0);

        broadcast(&[d1.clone(), d2.clone()], UpdateKind::Add, &ipcp).await;

        assert!(d1.upstream.is_readable().await);
        assert!(!d2.upstream.is_readable().await);
    }

    #[tokio::test]
    async fn subscription_replay_sends_one_add_per_existing_ipcp() {
        let device = Arc::new(ControlDevice::new("ns"));
        let ipcps = vec![mk_ipcp(0), mk_ipcp(2)];
        replay_subscription(&device, &ipcps).await;

        let mut buf = [0u8; 512];
        let mut seen = Vec::new();
        for _ in 0..2 {
            let n = device.upstream.read(&mut buf, false).await.unwrap();
            let msg = crate::message::CtrlMessage::from_bytes(&buf[..n]).unwrap();
            if let Body::IpcpUpdate { ipcp_id, .. } = msg.body {
                seen.push(ipcp_id);
            }
        }
        assert_eq!(seen, vec![0, 2]);
    }
}
