//! Message dispatcher (§4.H).
//!
//! Decodes one message, checks the capability table, routes to a handler,
//! and reports success/failure the way §7 specifies: a handler that
//! decided the request is "soft-denied" queues a negative response and
//! returns `Ok(())` (the transport delivered the outcome); a handler that
//! failed to act at all returns the error synchronously.

use crate::broadcaster;
use crate::control_device::ControlDevice;
use crate::dm::Dm;
use crate::error::{Error, Result};
use crate::factory::FactoryRegistry;
use crate::fetch::{FlowRow, RegRow};
use crate::flow_alloc::{self, FaReqOutcome};
use crate::ipcp::Ipcp;
use crate::message::{Body, CtrlMessage, MsgType, UpdateKind};
use std::sync::Arc;
use tracing::warn;

/// The privileged-only message types of §4.H. All others are unprivileged.
fn is_privileged(msg_type: MsgType) -> bool {
    matches!(
        msg_type,
        MsgType::IpcpCreate
            | MsgType::IpcpDestroy
            | MsgType::IpcpConfig
            | MsgType::PduftSet
            | MsgType::PduftFlush
            | MsgType::ApplRegisterResp
            | MsgType::UipcpSet
            | MsgType::UipcpFaReqArrived
            | MsgType::UipcpFaRespArrived
            | MsgType::FlowDealloc
    )
}

/// Shared context a dispatch call needs: the DM it operates in, the
/// process-wide factory registry (consulted only by `IPCP_CREATE`), and
/// the originating control device.
pub struct Dispatcher {
    pub dm: Arc<Dm>,
    pub factories: Arc<tokio::sync::Mutex<FactoryRegistry>>,
}

impl Dispatcher {
    pub fn new(dm: Arc<Dm>, factories: Arc<tokio::sync::Mutex<FactoryRegistry>>) -> Self {
        Self { dm, factories }
    }

    /// Decodes and dispatches one message from `device`'s control channel.
    pub async fn dispatch(&self, device: &Arc<ControlDevice>, bytes: &[u8]) -> Result<()> {
        let msg = CtrlMessage::from_bytes(bytes)?;
        let msg_type = MsgType::from_u16(msg.header.msg_type)?;

        if is_privileged(msg_type) && !device.is_privileged() {
            return Err(Error::Invalid(format!(
                "message type {msg_type:?} requires a privileged control device"
            )));
        }

        self.route(device, msg.header.event_id, msg.body).await
    }

    async fn route(&self, device: &Arc<ControlDevice>, event_id: u32, body: Body) -> Result<()> {
        match body {
            Body::IpcpCreate { name, dif_name, dif_type } => {
                self.handle_ipcp_create(device, event_id, name, dif_name, dif_type).await
            }
            Body::IpcpDestroy { ipcp_id } => self.handle_ipcp_destroy(event_id, ipcp_id).await,
            Body::IpcpConfig { ipcp_id, param, value } => {
                self.handle_ipcp_config(device, event_id, ipcp_id, param, value).await
            }
            Body::IpcpConfigGet { ipcp_id, param } => {
                self.handle_ipcp_config_get(device, event_id, ipcp_id, param).await
            }
            Body::IpcpStats { ipcp_id } => self.handle_ipcp_stats(device, event_id, ipcp_id).await,
            Body::IpcpQosSupported { ipcp_id, qos_id } => {
                self.handle_qos_supported(device, event_id, ipcp_id, qos_id).await
            }
            Body::UipcpSet { ipcp_id } => self.handle_uipcp_set(device, ipcp_id).await,
            Body::ApplRegister { dif_name, ipcp_id, appl_name, reg } => {
                self.handle_appl_register(device, event_id, dif_name, ipcp_id, appl_name, reg).await
            }
            Body::ApplRegisterResp { appl_name, response } => {
                self.handle_appl_register_resp(appl_name, response).await
            }
            Body::FaReq { dif_name, local_appl, remote_appl, flow_spec } => {
                self.handle_fa_req(device, event_id, dif_name, local_appl, remote_appl, flow_spec).await
            }
            Body::FaResp { port_id, kevent_id, response, upper_ipcp_id } => {
                self.handle_fa_resp(port_id, kevent_id, response == 0, upper_ipcp_id).await
            }
            Body::FaRespArrived { port_id, response } => {
                self.handle_fa_resp_arrived(port_id, response).await
            }
            Body::FlowDealloc { port_id, uid: _ } => self.handle_flow_dealloc(port_id).await,
            Body::FlowFetch { ipcp_id } => self.handle_flow_fetch(device, event_id, ipcp_id).await,
            Body::RegFetch { ipcp_id } => self.handle_reg_fetch(device, event_id, ipcp_id).await,
            Body::SetFlags { subscribe_ipcp_updates } => {
                self.handle_set_flags(device, subscribe_ipcp_updates).await
            }
            Body::UipcpFaReqArrived {
                ipcp_id,
                remote_port,
                remote_cep,
                remote_addr,
                local_appl,
                remote_appl,
                kevent_id,
                flow_spec,
            } => {
                self.handle_uipcp_fa_req_arrived(
                    ipcp_id, remote_port, remote_cep, remote_addr, local_appl, remote_appl, kevent_id, flow_spec,
                )
                .await
            }
            Body::UipcpFaRespArrived {
                local_port,
                response,
                remote_port,
                remote_cep,
                remote_addr,
            } => {
                self.handle_uipcp_fa_resp_arrived(local_port, response, remote_port, remote_cep, remote_addr).await
            }
            other => Err(Error::Unsupported(format!("no handler wired for {other:?}"))),
        }
    }

    async fn reply(&self, device: &Arc<ControlDevice>, msg_type: MsgType, event_id: u32, body: Body) {
        let msg = CtrlMessage::new(msg_type, event_id, body);
        let _ = device.upstream.append(&msg, true).await;
    }

    async fn handle_ipcp_create(
        &self,
        device: &Arc<ControlDevice>,
        event_id: u32,
        name: String,
        dif_name: String,
        dif_type: String,
    ) -> Result<()> {
        let mut ipcps = self.dm.ipcps.lock().await;
        if ipcps.name_exists(&name) {
            return Err(Error::Invalid(format!("IPCP name '{name}' already in use")));
        }
        let factory = self
            .factories
            .lock()
            .await
            .find(&dif_type)
            .ok_or_else(|| Error::Unsupported(format!("no factory for DIF type '{dif_type}'")))?;

        let dif = self.dm.difs.lock().await.get_or_create(&dif_name, &dif_type)?;
        let ipcp_id = ipcps.bitmap.alloc()? as u16;
        let ipcp = Ipcp::new(ipcp_id, name, dif, factory.clone());
        factory.create(ipcp_id).await?;
        ipcps.insert(ipcp.clone());
        drop(ipcps);

        self.reply(
            device,
            MsgType::IpcpCreateResp,
            event_id,
            Body::IpcpCreateResp { result: 0, ipcp_id },
        )
        .await;

        let devices = self.dm.device_snapshot().await;
        broadcaster::broadcast(&devices, UpdateKind::Add, &ipcp).await;
        Ok(())
    }

    async fn handle_ipcp_destroy(&self, _event_id: u32, ipcp_id: u16) -> Result<()> {
        let ipcp = self
            .dm
            .ipcps
            .lock()
            .await
            .get(ipcp_id)
            .ok_or_else(|| Error::NoDevice(format!("no such IPCP: {ipcp_id}")))?;
        crate::lifecycle::ipcp_mark_zombie(&self.dm, &ipcp).await;
        crate::lifecycle::ipcp_put(&self.dm, ipcp).await;
        Ok(())
    }

    async fn handle_ipcp_config(
        &self,
        device: &Arc<ControlDevice>,
        event_id: u32,
        ipcp_id: u16,
        param: String,
        value: String,
    ) -> Result<()> {
        let ipcp = self
            .dm
            .ipcps
            .lock()
            .await
            .get(ipcp_id)
            .ok_or_else(|| Error::NoDevice(format!("no such IPCP: {ipcp_id}")))?;
        let result = crate::config::apply(&ipcp, &param, &value).await;
        let broadcast_update = result.is_ok() && param == "mss";
        self.reply(
            device,
            MsgType::GenericResp,
            event_id,
            Body::GenericResp {
                result: if result.is_ok() { 0 } else { -1 },
            },
        )
        .await;
        if broadcast_update {
            let devices = self.dm.device_snapshot().await;
            broadcaster::broadcast(&devices, UpdateKind::Upd, &ipcp).await;
        }
        result
    }

    async fn handle_ipcp_config_get(
        &self,
        device: &Arc<ControlDevice>,
        event_id: u32,
        ipcp_id: u16,
        param: String,
    ) -> Result<()> {
        let ipcp = self
            .dm
            .ipcps
            .lock()
            .await
            .get(ipcp_id)
            .ok_or_else(|| Error::NoDevice(format!("no such IPCP: {ipcp_id}")))?;
        match crate::config::get(&ipcp, &param).await {
            Ok(value) => {
                self.reply(
                    device,
                    MsgType::IpcpConfigGetResp,
                    event_id,
                    Body::IpcpConfigGetResp { result: 0, value },
                )
                .await;
                Ok(())
            }
            Err(e) => {
                self.reply(
                    device,
                    MsgType::IpcpConfigGetResp,
                    event_id,
                    Body::IpcpConfigGetResp { result: -1, value: String::new() },
                )
                .await;
                Err(e)
            }
        }
    }

    async fn handle_ipcp_stats(&self, device: &Arc<ControlDevice>, event_id: u32, ipcp_id: u16) -> Result<()> {
        let ipcp = self
            .dm
            .ipcps
            .lock()
            .await
            .get(ipcp_id)
            .ok_or_else(|| Error::NoDevice(format!("no such IPCP: {ipcp_id}")))?;
        let snap = ipcp.stats.aggregate();
        self.reply(
            device,
            MsgType::IpcpStatsResp,
            event_id,
            Body::IpcpStatsResp {
                result: 0,
                tx_pdus: snap.tx_pdus,
                rx_pdus: snap.rx_pdus,
                tx_bytes: snap.tx_bytes,
                rx_bytes: snap.rx_bytes,
            },
        )
        .await;
        Ok(())
    }

    async fn handle_qos_supported(
        &self,
        device: &Arc<ControlDevice>,
        event_id: u32,
        ipcp_id: u16,
        qos_id: u32,
    ) -> Result<()> {
        let ipcp = self
            .dm
            .ipcps
            .lock()
            .await
            .get(ipcp_id)
            .ok_or_else(|| Error::NoDevice(format!("no such IPCP: {ipcp_id}")))?;
        let supported = ipcp.factory.qos_supported(qos_id);
        self.reply(
            device,
            MsgType::GenericResp,
            event_id,
            Body::GenericResp { result: if supported { 0 } else { 1 } },
        )
        .await;
        Ok(())
    }

    async fn handle_uipcp_set(&self, device: &Arc<ControlDevice>, ipcp_id: u16) -> Result<()> {
        let ipcp = self
            .dm
            .ipcps
            .lock()
            .await
            .get(ipcp_id)
            .ok_or_else(|| Error::NoDevice(format!("no such IPCP: {ipcp_id}")))?;
        *ipcp.uipcp.lock() = Some(device.id);
        device.is_uipcp.store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn handle_appl_register(
        &self,
        device: &Arc<ControlDevice>,
        event_id: u32,
        dif_name: String,
        ipcp_id: u16,
        appl_name: crate::message::ApplName,
        reg: bool,
    ) -> Result<()> {
        let ipcp = self
            .dm
            .ipcps
            .lock()
            .await
            .get(ipcp_id)
            .ok_or_else(|| Error::NoDevice(format!("no such IPCP: {ipcp_id}")))?;

        if !reg {
            let mut registries = self.dm.app_registries.lock().await;
            registries.entry(ipcp_id).or_default().unregister(&appl_name, device.id)?;
            return Ok(());
        }

        {
            let mut registries = self.dm.app_registries.lock().await;
            if let Err(e) = registries.entry(ipcp_id).or_default().begin_register(&appl_name, device.id) {
                drop(registries);
                self.reply(
                    device,
                    MsgType::ApplRegisterResp,
                    event_id,
                    Body::ApplRegisterResp { appl_name, response: 1 },
                )
                .await;
                return Err(e);
            }
        }

        // A kernel-side (in-process) factory hook can answer synchronously;
        // absent one, reflect the request to the IPCP's attached uipcp and
        // leave the registration PENDING until its APPL_REGISTER_RESP
        // completes it (§4.F, §8 scenario 2).
        match ipcp.factory.appl_register(ipcp_id, &appl_name).await {
            crate::factory::SyncOutcome::NotImplemented => {
                let Some(uipcp_id) = *ipcp.uipcp.lock() else {
                    let mut registries = self.dm.app_registries.lock().await;
                    registries.entry(ipcp_id).or_default().unregister(&appl_name, device.id).ok();
                    drop(registries);
                    self.reply(
                        device,
                        MsgType::ApplRegisterResp,
                        event_id,
                        Body::ApplRegisterResp { appl_name, response: 1 },
                    )
                    .await;
                    return Err(Error::NoDevice(
                        "IPCP has neither a kernel appl_register hook nor an attached uipcp".into(),
                    ));
                };
                if let Some(target) = self.find_device(uipcp_id).await {
                    self.reply(
                        &target,
                        MsgType::ApplRegister,
                        0,
                        Body::ApplRegister { dif_name, ipcp_id, appl_name, reg: true },
                    )
                    .await;
                }
                Ok(())
            }
            crate::factory::SyncOutcome::Accepted => {
                let mut registries = self.dm.app_registries.lock().await;
                registries.entry(ipcp_id).or_default().complete_register(&appl_name, true)?;
                drop(registries);
                self.reply(
                    device,
                    MsgType::ApplRegisterResp,
                    event_id,
                    Body::ApplRegisterResp { appl_name, response: 0 },
                )
                .await;
                Ok(())
            }
            crate::factory::SyncOutcome::Refused => {
                let mut registries = self.dm.app_registries.lock().await;
                registries.entry(ipcp_id).or_default().unregister(&appl_name, device.id).ok();
                drop(registries);
                self.reply(
                    device,
                    MsgType::ApplRegisterResp,
                    event_id,
                    Body::ApplRegisterResp { appl_name, response: 1 },
                )
                .await;
                Err(Error::Invalid("IPCP refused application registration".into()))
            }
        }
    }

    /// Applies an `APPL_REGISTER_RESP` from a uipcp and relays it to the
    /// control device that originally issued the `APPL_REGISTER` (§8
    /// scenario 2 "D_s receives the same response"). A `response != 0`
    /// (failure) leaves the registration's state untouched per §9 Open
    /// Question b, but is still relayed so the caller learns of it.
    async fn handle_appl_register_resp(&self, appl_name: crate::message::ApplName, response: i32) -> Result<()> {
        let owner = {
            let mut registries = self.dm.app_registries.lock().await;
            let mut found = None;
            for registry in registries.values_mut() {
                if registry.state(&appl_name).is_some() {
                    if response == 0 {
                        registry.complete_register(&appl_name, true)?;
                    } else {
                        warn!(%appl_name, response, "uipcp refused application registration");
                    }
                    found = registry.owner_of(&appl_name);
                    break;
                }
            }
            match found {
                Some(owner) => owner,
                None if response != 0 => return Ok(()),
                None => return Err(Error::Invalid(format!("no pending registration for '{appl_name}'"))),
            }
        };

        if let Some(target) = self.find_device(owner).await {
            self.reply(
                &target,
                MsgType::ApplRegisterResp,
                0,
                Body::ApplRegisterResp { appl_name, response },
            )
            .await;
        }
        Ok(())
    }

    async fn handle_fa_req(
        &self,
        device: &Arc<ControlDevice>,
        event_id: u32,
        dif_name: Option<String>,
        local_appl: crate::message::ApplName,
        remote_appl: crate::message::ApplName,
        flow_spec: crate::message::FlowSpec,
    ) -> Result<()> {
        match flow_alloc::fa_req(&self.dm, dif_name.as_deref(), local_appl, remote_appl, flow_spec, device.id, event_id).await {
            Ok((_ipcp, FaReqOutcome::Synchronous { accepted, flow })) => {
                self.reply(
                    device,
                    MsgType::FaRespArrived,
                    event_id,
                    Body::FaRespArrived {
                        port_id: flow.port_id,
                        response: if accepted { 0 } else { 1 },
                    },
                )
                .await;
                Ok(())
            }
            Ok((ipcp, FaReqOutcome::ReflectToUipcp { flow })) => {
                let uipcp_id = (*ipcp.uipcp.lock()).expect("reflect implies an attached uipcp");
                if let Some(target) = self.find_device(uipcp_id).await {
                    self.reply(
                        &target,
                        MsgType::FaReqArrived,
                        0,
                        Body::FaReqArrived {
                            port_id: flow.port_id,
                            local_appl: flow.local_appl.clone(),
                            remote_appl: flow.remote_appl.clone(),
                            dif_name: ipcp.dif.name.clone(),
                        },
                    )
                    .await;
                }
                Ok(())
            }
            Err(e) => {
                self.reply(
                    device,
                    MsgType::FaRespArrived,
                    event_id,
                    Body::FaRespArrived { port_id: 0, response: 1 },
                )
                .await;
                Err(e)
            }
        }
    }

    async fn handle_fa_resp(
        &self,
        port_id: u32,
        kevent_id: u32,
        accept: bool,
        upper_ipcp_id: Option<u16>,
    ) -> Result<()> {
        flow_alloc::fa_resp(&self.dm, port_id, kevent_id, accept, upper_ipcp_id).await?;
        Ok(())
    }

    async fn handle_fa_resp_arrived(&self, port_id: u32, response: i32) -> Result<()> {
        let flow = self.dm.flows.read().await.get(port_id);
        let Some(flow) = flow else {
            return Err(Error::NoDevice(format!("no such flow: port {port_id}")));
        };
        flow_alloc::fa_resp_arrived(&self.dm, port_id, flow.uid, response == 0).await?;
        Ok(())
    }

    /// UIPCP_FA_REQ_ARRIVED (§4.G step 2 trigger): a uipcp reports that a
    /// FA_REQ arrived over the network for one of its locally registered
    /// applications. Fails *invalid* if `local_appl` isn't registered on
    /// `ipcp_id`; otherwise allocates the server-side flow and delivers
    /// FA_REQ_ARRIVED to the registered application's control device.
    #[allow(clippy::too_many_arguments)]
    async fn handle_uipcp_fa_req_arrived(
        &self,
        ipcp_id: u16,
        remote_port: u32,
        remote_cep: u32,
        remote_addr: u64,
        local_appl: crate::message::ApplName,
        remote_appl: crate::message::ApplName,
        kevent_id: u32,
        flow_spec: crate::message::FlowSpec,
    ) -> Result<()> {
        let owner = {
            let registries = self.dm.app_registries.lock().await;
            let registry = registries.get(&ipcp_id).ok_or_else(|| {
                Error::Invalid(format!("application '{local_appl}' not registered on IPCP {ipcp_id}"))
            })?;
            if !registry.is_registered(&local_appl) {
                return Err(Error::Invalid(format!(
                    "application '{local_appl}' not registered on IPCP {ipcp_id}"
                )));
            }
            registry
                .owner_of(&local_appl)
                .ok_or_else(|| Error::Invalid(format!("application '{local_appl}' has no owning control device")))?
        };
        let target = self
            .find_device(owner)
            .await
            .ok_or_else(|| Error::NoDevice(format!("control device {owner} is gone")))?;

        let dif_name = self
            .dm
            .ipcps
            .lock()
            .await
            .get(ipcp_id)
            .map(|ipcp| ipcp.dif.name.clone())
            .ok_or_else(|| Error::NoDevice(format!("no such IPCP: {ipcp_id}")))?;

        let flow = flow_alloc::fa_req_arrived(
            &self.dm,
            ipcp_id,
            local_appl.clone(),
            remote_appl.clone(),
            remote_port,
            Some(remote_cep),
            remote_addr,
            kevent_id,
            flow_spec,
        )
        .await?;

        self.reply(
            &target,
            MsgType::FaReqArrived,
            0,
            Body::FaReqArrived {
                port_id: flow.port_id,
                local_appl,
                remote_appl,
                dif_name,
            },
        )
        .await;
        Ok(())
    }

    /// UIPCP_FA_RESP_ARRIVED (§4.G step 4 trigger): a uipcp reports the
    /// remote side's answer to a client-side flow it carried the FA_REQ
    /// for. Fills in the flow's remote identity and delivers
    /// FA_RESP_ARRIVED, with the original FA_REQ's `event_id`, to the
    /// control device that issued it.
    async fn handle_uipcp_fa_resp_arrived(
        &self,
        local_port: u32,
        response: i32,
        remote_port: u32,
        remote_cep: u32,
        remote_addr: u64,
    ) -> Result<()> {
        let flow = self
            .dm
            .flows
            .read()
            .await
            .get(local_port)
            .ok_or_else(|| Error::NoDevice(format!("no such flow: port {local_port}")))?;
        *flow.remote_port.lock() = Some(remote_port);
        *flow.remote_cep.lock() = Some(remote_cep);
        *flow.remote_addr.lock() = Some(remote_addr);

        let owner_device = *flow.owner_device.lock();
        let owner_event_id = (*flow.owner_event_id.lock()).unwrap_or(0);
        flow_alloc::fa_resp_arrived(&self.dm, local_port, flow.uid, response == 0).await?;

        if let Some(owner_device) = owner_device {
            if let Some(target) = self.find_device(owner_device).await {
                self.reply(
                    &target,
                    MsgType::FaRespArrived,
                    owner_event_id,
                    Body::FaRespArrived { port_id: local_port, response },
                )
                .await;
            }
        }
        Ok(())
    }

    async fn handle_flow_dealloc(&self, port_id: u32) -> Result<()> {
        let ipcp_id = self.dm.flows.read().await.get(port_id).map(|f| f.ipcp_id);
        let wait_ms = match ipcp_id {
            Some(id) => self
                .dm
                .ipcps
                .lock()
                .await
                .get(id)
                .map(|ipcp| *ipcp.flow_del_wait_ms.lock())
                .unwrap_or(crate::ipcp::FLOW_DEL_WAIT_MS_DEFAULT),
            None => crate::ipcp::FLOW_DEL_WAIT_MS_DEFAULT,
        };
        // `flow_request_dealloc` itself double-checks DEALLOCATED under lock,
        // so a concurrent caller that loses the race gets a real no-device
        // error here instead of a silent `Ok` (§8 scenario 3: "the second
        // sees no-device").
        let transitioned = crate::lifecycle::flow_request_dealloc(&self.dm, port_id, wait_ms).await;
        if !transitioned {
            return Err(Error::NoDevice(format!("flow {port_id} already deallocated or gone")));
        }
        Ok(())
    }

    async fn handle_flow_fetch(&self, device: &Arc<ControlDevice>, event_id: u32, ipcp_filter: Option<u16>) -> Result<()> {
        let rows: Vec<FlowRow> = {
            let flows = self.dm.flows.read().await;
            flows
                .iter()
                .filter(|f| ipcp_filter.map(|id| id == f.ipcp_id).unwrap_or(true))
                .map(|f| FlowRow {
                    port_id: f.port_id,
                    local_appl: f.local_appl.clone(),
                    remote_appl: f.remote_appl.clone(),
                    ipcp_id: f.ipcp_id,
                })
                .collect()
        };
        let body = device.fetch.flow_fetch(move || rows);
        self.reply(device, MsgType::FlowFetchResp, event_id, body).await;
        Ok(())
    }

    async fn handle_reg_fetch(&self, device: &Arc<ControlDevice>, event_id: u32, ipcp_filter: Option<u16>) -> Result<()> {
        let registries = self.dm.app_registries.lock().await;
        let mut rows = Vec::new();
        for (&ipcp_id, registry) in registries.iter() {
            if ipcp_filter.map(|f| f == ipcp_id).unwrap_or(true) {
                for name in registry.iter_complete() {
                    rows.push(RegRow { appl_name: name.clone(), ipcp_id, pending: false });
                }
            }
        }
        drop(registries);
        let body = device.fetch.reg_fetch(|| rows);
        self.reply(device, MsgType::RegFetchResp, event_id, body).await;
        Ok(())
    }

    async fn handle_set_flags(&self, device: &Arc<ControlDevice>, subscribe: bool) -> Result<()> {
        device.set_subscribed(subscribe);
        if subscribe {
            let ipcps = self.dm.ipcps.lock().await;
            let live: Vec<Arc<Ipcp>> = ipcps.iter().filter(|i| !i.is_zombie()).cloned().collect();
            drop(ipcps);
            broadcaster::replay_subscription(device, &live).await;
        }
        Ok(())
    }

    async fn find_device(&self, id: u64) -> Option<Arc<ControlDevice>> {
        self.dm.devices.lock().await.iter().find(|d| d.id == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{FactoryRegistry, NullIpcpFactory};
    use crate::message::{ApplName, FlowSpec};
    use tokio::sync::Mutex;

    async fn setup() -> (Dispatcher, Arc<ControlDevice>) {
        let dm = Dm::new("ns");
        let mut factories = FactoryRegistry::new();
        factories.register(NullIpcpFactory::new("normal")).unwrap();
        let dispatcher = Dispatcher::new(dm.clone(), Arc::new(Mutex::new(factories)));
        let root = Arc::new(ControlDevice::new("ns"));
        root.set_privileged(true);
        dm.register_device(root.clone()).await;
        (dispatcher, root)
    }

    async fn recv(device: &ControlDevice) -> CtrlMessage {
        let mut buf = vec![0u8; 4096];
        let n = device.upstream.read(&mut buf, true).await.unwrap();
        CtrlMessage::from_bytes(&buf[..n]).unwrap()
    }

    async fn new_device(dispatcher: &Dispatcher, privileged: bool) -> Arc<ControlDevice> {
        let device = Arc::new(ControlDevice::new("ns"));
        device.set_privileged(privileged);
        dispatcher.dm.register_device(device.clone()).await;
        device
    }

    /// Full §8 scenario 2 round trip: app registration via a uipcp, then a
    /// flow allocated end-to-end through UIPCP_FA_REQ_ARRIVED /
    /// UIPCP_FA_RESP_ARRIVED.
    #[tokio::test]
    async fn flow_allocation_end_to_end_via_uipcp() {
        let (dispatcher, root) = setup().await;
        dispatcher
            .route(
                &root,
                7,
                Body::IpcpCreate {
                    name: "n.A".into(),
                    dif_name: "d1".into(),
                    dif_type: "normal".into(),
                },
            )
            .await
            .unwrap();
        let create_resp = recv(&root).await;
        let ipcp_id = match create_resp.body {
            Body::IpcpCreateResp { ipcp_id, .. } => ipcp_id,
            other => panic!("expected IpcpCreateResp, got {other:?}"),
        };

        let d_u = new_device(&dispatcher, true).await;
        dispatcher.route(&d_u, 0, Body::UipcpSet { ipcp_id }).await.unwrap();

        let d_s = new_device(&dispatcher, false).await;
        dispatcher
            .route(
                &d_s,
                1,
                Body::ApplRegister {
                    dif_name: "d1".into(),
                    ipcp_id,
                    appl_name: ApplName::new("srv"),
                    reg: true,
                },
            )
            .await
            .unwrap();

        let forwarded = recv(&d_u).await;
        assert!(matches!(
            forwarded.body,
            Body::ApplRegister { reg: true, .. }
        ));

        dispatcher
            .route(
                &d_u,
                0,
                Body::ApplRegisterResp {
                    appl_name: ApplName::new("srv"),
                    response: 0,
                },
            )
            .await
            .unwrap();
        let register_resp = recv(&d_s).await;
        assert!(matches!(
            register_resp.body,
            Body::ApplRegisterResp { response: 0, .. }
        ));

        let d_c = new_device(&dispatcher, false).await;
        dispatcher
            .route(
                &d_c,
                42,
                Body::FaReq {
                    dif_name: Some("d1".into()),
                    local_appl: ApplName::new("cli"),
                    remote_appl: ApplName::new("srv"),
                    flow_spec: FlowSpec::default(),
                },
            )
            .await
            .unwrap();

        let reflected = recv(&d_u).await;
        let p1 = match reflected.body {
            Body::FaReqArrived { port_id, .. } => port_id,
            other => panic!("expected a reflected FA_REQ, got {other:?}"),
        };

        dispatcher
            .route(
                &d_u,
                0,
                Body::UipcpFaReqArrived {
                    ipcp_id,
                    remote_port: p1,
                    remote_cep: 0,
                    remote_addr: 0xdead,
                    local_appl: ApplName::new("srv"),
                    remote_appl: ApplName::new("cli"),
                    kevent_id: 55,
                    flow_spec: FlowSpec::default(),
                },
            )
            .await
            .unwrap();

        let fa_req_arrived = recv(&d_s).await;
        let p2 = match fa_req_arrived.body {
            Body::FaReqArrived { port_id, .. } => port_id,
            other => panic!("expected FA_REQ_ARRIVED, got {other:?}"),
        };
        assert_ne!(p1, p2);

        dispatcher
            .route(
                &d_s,
                0,
                Body::FaResp {
                    port_id: p2,
                    kevent_id: 55,
                    response: 0,
                    upper_ipcp_id: None,
                },
            )
            .await
            .unwrap();

        dispatcher
            .route(
                &d_u,
                0,
                Body::UipcpFaRespArrived {
                    local_port: p1,
                    response: 0,
                    remote_port: p2,
                    remote_cep: 0,
                    remote_addr: 0xbeef,
                },
            )
            .await
            .unwrap();

        let fa_resp_arrived = recv(&d_c).await;
        assert_eq!(fa_resp_arrived.header.event_id, 42);
        match fa_resp_arrived.body {
            Body::FaRespArrived { port_id, response } => {
                assert_eq!(port_id, p1);
                assert_eq!(response, 0);
            }
            other => panic!("expected FA_RESP_ARRIVED, got {other:?}"),
        }

        let flow_p1 = dispatcher.dm.flows.read().await.get(p1).unwrap();
        assert!(flow_p1.is_allocated());
        let flow_p2 = dispatcher.dm.flows.read().await.get(p2).unwrap();
        assert!(flow_p2.is_allocated());
    }

    #[tokio::test]
    async fn uipcp_fa_req_arrived_rejects_unregistered_application() {
        let (dispatcher, root) = setup().await;
        dispatcher
            .route(
                &root,
                1,
                Body::IpcpCreate {
                    name: "n.A".into(),
                    dif_name: "d1".into(),
                    dif_type: "normal".into(),
                },
            )
            .await
            .unwrap();
        let ipcp_id = match recv(&root).await.body {
            Body::IpcpCreateResp { ipcp_id, .. } => ipcp_id,
            other => panic!("expected IpcpCreateResp, got {other:?}"),
        };

        let d_u = new_device(&dispatcher, true).await;
        let result = dispatcher
            .route(
                &d_u,
                0,
                Body::UipcpFaReqArrived {
                    ipcp_id,
                    remote_port: 1,
                    remote_cep: 0,
                    remote_addr: 0,
                    local_appl: ApplName::new("ghost"),
                    remote_appl: ApplName::new("cli"),
                    kevent_id: 1,
                    flow_spec: FlowSpec::default(),
                },
            )
            .await;
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    /// §8 scenario 1: subscribing before any IPCP exists replays nothing; a
    /// later subscriber sees the IPCP created in between.
    #[tokio::test]
    async fn subscription_replay_reflects_ipcps_created_before_it() {
        let (dispatcher, root) = setup().await;

        let d1 = new_device(&dispatcher, false).await;
        dispatcher.route(&d1, 0, Body::SetFlags { subscribe_ipcp_updates: true }).await.unwrap();
        assert!(!d1.upstream.is_readable().await);

        dispatcher
            .route(
                &root,
                7,
                Body::IpcpCreate {
                    name: "n.A".into(),
                    dif_name: "d1".into(),
                    dif_type: "normal".into(),
                },
            )
            .await
            .unwrap();
        let create_resp = recv(&root).await;
        assert!(matches!(create_resp.body, Body::IpcpCreateResp { ipcp_id: 0, .. }));

        let add_to_d1 = recv(&d1).await;
        match add_to_d1.body {
            Body::IpcpUpdate { kind: UpdateKind::Add, ipcp_id: 0, .. } => {}
            other => panic!("expected IPCP_UPDATE ADD, got {other:?}"),
        }

        let d2 = new_device(&dispatcher, false).await;
        dispatcher.route(&d2, 0, Body::SetFlags { subscribe_ipcp_updates: true }).await.unwrap();
        let add_to_d2 = recv(&d2).await;
        match add_to_d2.body {
            Body::IpcpUpdate { kind: UpdateKind::Add, ipcp_id: 0, .. } => {}
            other => panic!("expected IPCP_UPDATE ADD, got {other:?}"),
        }
    }

    /// §8 scenario 4: a second control device attempting to register an
    /// already-registered application name is rejected and leaves the
    /// original registration untouched.
    #[tokio::test]
    async fn duplicate_registration_on_another_device_is_rejected() {
        let (dispatcher, root) = setup().await;
        dispatcher
            .route(
                &root,
                1,
                Body::IpcpCreate {
                    name: "n.A".into(),
                    dif_name: "d1".into(),
                    dif_type: "normal".into(),
                },
            )
            .await
            .unwrap();
        let ipcp_id = match recv(&root).await.body {
            Body::IpcpCreateResp { ipcp_id, .. } => ipcp_id,
            other => panic!("expected IpcpCreateResp, got {other:?}"),
        };

        let d_u = new_device(&dispatcher, true).await;
        dispatcher.route(&d_u, 0, Body::UipcpSet { ipcp_id }).await.unwrap();

        let d_s = new_device(&dispatcher, false).await;
        dispatcher
            .route(
                &d_s,
                1,
                Body::ApplRegister {
                    dif_name: "d1".into(),
                    ipcp_id,
                    appl_name: ApplName::new("srv"),
                    reg: true,
                },
            )
            .await
            .unwrap();

        let d_s2 = new_device(&dispatcher, false).await;
        let result = dispatcher
            .route(
                &d_s2,
                2,
                Body::ApplRegister {
                    dif_name: "d1".into(),
                    ipcp_id,
                    appl_name: ApplName::new("srv"),
                    reg: true,
                },
            )
            .await;
        assert!(result.is_err());
        let refusal = recv(&d_s2).await;
        assert!(matches!(
            refusal.body,
            Body::ApplRegisterResp { response: 1, .. }
        ));

        assert_eq!(
            dispatcher
                .dm
                .app_registries
                .lock()
                .await
                .get(&ipcp_id)
                .unwrap()
                .owner_of(&ApplName::new("srv")),
            Some(d_s.id)
        );
    }

    /// §8 scenario 3: both the uipcp and the client race to deallocate the
    /// same flow; exactly one succeeds.
    #[tokio::test]
    async fn deallocation_race_is_harmless() {
        let (dispatcher, root) = setup().await;
        let flow = crate::flow::Flow::new(
            9,
            0,
            ApplName::new("cli"),
            ApplName::new("srv"),
            FlowSpec::default(),
            dispatcher.dm.next_uid(),
            true,
        );
        flow.mark_allocated(None);
        dispatcher.dm.flows.write().await.insert(flow);

        let first = dispatcher.route(&root, 0, Body::FlowDealloc { port_id: 9, uid: 1 }).await;
        let second = dispatcher.route(&root, 0, Body::FlowDealloc { port_id: 9, uid: 1 }).await;
        assert!(first.is_ok());
        assert!(second.is_err());
    }
}

