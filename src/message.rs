//! # Control-message codec
//!
//! Every request, response and asynchronous notification exchanged between
//! an application/uipcp and the core travels as one `CtrlMessage`. Each
//! message carries a common header `{ msg_type, event_id }` (§6) followed by
//! a type-specific body. The wire representation is little-endian and
//! length-prefixed; the length prefix itself is owned by the transport
//! (`server.rs`), not by this module, so the codec can be reused by any
//! framing (matching the teacher's split between `Message::to_bytes` and
//! the length-prefixing done in `ipc/unix_domain_socket.rs`).
//!
//! Strings in a decoded message own their storage (plain `String`/`Vec<u8>`)
//! and are dropped the ordinary Rust way; the "recursive free that respects
//! the message's declared field table" of the C original is simply `Drop`
//! here.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// RINA four-part structured application name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApplName {
    pub process_name: String,
    pub process_instance: String,
    pub entity_name: String,
    pub entity_instance: String,
}

impl ApplName {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            ..Default::default()
        }
    }
}

impl std::fmt::Display for ApplName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.process_name, self.process_instance, self.entity_name, self.entity_instance
        )
    }
}

/// Numeric message-type tag carried in every header.
///
/// The ordering here is cosmetic; what matters is that each variant is
/// stable (used by `Dispatcher::MAX` and the capability table in §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum MsgType {
    IpcpCreate = 1,
    IpcpCreateResp = 2,
    IpcpDestroy = 3,
    IpcpConfig = 4,
    IpcpConfigGet = 5,
    IpcpConfigGetResp = 6,
    IpcpStats = 7,
    IpcpStatsResp = 8,
    IpcpQosSupported = 9,
    IpcpUpdate = 10,
    UipcpSet = 11,
    UipcpWait = 12,
    ApplRegister = 13,
    ApplRegisterResp = 14,
    ApplMove = 15,
    FaReq = 16,
    FaResp = 17,
    FaReqArrived = 18,
    FaRespArrived = 19,
    UipcpFaReqArrived = 20,
    UipcpFaRespArrived = 21,
    FlowDealloc = 22,
    FlowDeallocated = 23,
    FlowStats = 24,
    FlowCfgUpdate = 25,
    FlowFetch = 26,
    FlowFetchResp = 27,
    RegFetch = 28,
    RegFetchResp = 29,
    PduftSet = 30,
    PduftDel = 31,
    PduftFlush = 32,
    SetFlags = 33,
    GenericResp = 34,
}

impl MsgType {
    /// Highest defined numeric value; used by the dispatcher to reject
    /// out-of-range types with `unknown-type` before even looking up a
    /// handler.
    pub const MAX: u16 = 34;

    pub fn from_u16(v: u16) -> Result<Self> {
        use MsgType::*;
        Ok(match v {
            1 => IpcpCreate,
            2 => IpcpCreateResp,
            3 => IpcpDestroy,
            4 => IpcpConfig,
            5 => IpcpConfigGet,
            6 => IpcpConfigGetResp,
            7 => IpcpStats,
            8 => IpcpStatsResp,
            9 => IpcpQosSupported,
            10 => IpcpUpdate,
            11 => UipcpSet,
            12 => UipcpWait,
            13 => ApplRegister,
            14 => ApplRegisterResp,
            15 => ApplMove,
            16 => FaReq,
            17 => FaResp,
            18 => FaReqArrived,
            19 => FaRespArrived,
            20 => UipcpFaReqArrived,
            21 => UipcpFaRespArrived,
            22 => FlowDealloc,
            23 => FlowDeallocated,
            24 => FlowStats,
            25 => FlowCfgUpdate,
            26 => FlowFetch,
            27 => FlowFetchResp,
            28 => RegFetch,
            29 => RegFetchResp,
            30 => PduftSet,
            31 => PduftDel,
            32 => PduftFlush,
            33 => SetFlags,
            34 => GenericResp,
            other => {
                return Err(Error::Unsupported(format!(
                    "unknown message type {other}"
                )))
            }
        })
    }
}

/// Common header present on every message (§6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Header {
    pub msg_type: u16,
    pub event_id: u32,
}

/// IPCP update kind broadcast by the update broadcaster (§4.K).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    Add,
    Upd,
    Del,
    UipcpDel,
}

/// QoS identifier, opaque beyond equality.
pub type QosId = u32;

/// The body of a decoded control message. One variant per message family in
/// §6. `Header` fields (`msg_type`/`event_id`) are carried alongside the
/// body in `CtrlMessage` rather than duplicated in each variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Body {
    IpcpCreate {
        name: String,
        dif_name: String,
        dif_type: String,
    },
    IpcpCreateResp {
        result: i32,
        ipcp_id: u16,
    },
    IpcpDestroy {
        ipcp_id: u16,
    },
    IpcpConfig {
        ipcp_id: u16,
        param: String,
        value: String,
    },
    IpcpConfigGet {
        ipcp_id: u16,
        param: String,
    },
    IpcpConfigGetResp {
        result: i32,
        value: String,
    },
    IpcpStats {
        ipcp_id: u16,
    },
    IpcpStatsResp {
        result: i32,
        tx_pdus: u64,
        rx_pdus: u64,
        tx_bytes: u64,
        rx_bytes: u64,
    },
    IpcpQosSupported {
        ipcp_id: u16,
        qos_id: QosId,
    },
    IpcpUpdate {
        kind: UpdateKind,
        ipcp_id: u16,
        dif_name: String,
        dif_type: String,
        max_sdu_size: u32,
    },
    UipcpSet {
        ipcp_id: u16,
    },
    UipcpWait {
        ipcp_id: u16,
    },
    ApplRegister {
        dif_name: String,
        ipcp_id: u16,
        appl_name: ApplName,
        reg: bool,
    },
    ApplRegisterResp {
        appl_name: ApplName,
        response: i32,
    },
    ApplMove {
        appl_name: ApplName,
        ipcp_id: u16,
    },
    FaReq {
        dif_name: Option<String>,
        local_appl: ApplName,
        remote_appl: ApplName,
        flow_spec: FlowSpec,
    },
    FaResp {
        port_id: u32,
        kevent_id: u32,
        response: i32,
        upper_ipcp_id: Option<u16>,
    },
    FaReqArrived {
        port_id: u32,
        local_appl: ApplName,
        remote_appl: ApplName,
        dif_name: String,
    },
    FaRespArrived {
        port_id: u32,
        response: i32,
    },
    UipcpFaReqArrived {
        ipcp_id: u16,
        remote_port: u32,
        remote_cep: u32,
        remote_addr: u64,
        local_appl: ApplName,
        remote_appl: ApplName,
        kevent_id: u32,
        flow_spec: FlowSpec,
    },
    UipcpFaRespArrived {
        local_port: u32,
        response: i32,
        remote_port: u32,
        remote_cep: u32,
        remote_addr: u64,
    },
    FlowDealloc {
        port_id: u32,
        uid: u32,
    },
    FlowDeallocated {
        port_id: u32,
    },
    FlowStats {
        port_id: u32,
    },
    FlowCfgUpdate {
        port_id: u32,
        param: String,
        value: String,
    },
    FlowFetch {
        ipcp_id: Option<u16>,
    },
    FlowFetchResp {
        end: bool,
        port_id: u32,
        local_appl: ApplName,
        remote_appl: ApplName,
        ipcp_id: u16,
    },
    RegFetch {
        ipcp_id: Option<u16>,
    },
    RegFetchResp {
        end: bool,
        appl_name: ApplName,
        ipcp_id: u16,
        pending: bool,
    },
    PduftSet {
        ipcp_id: u16,
        dest_addr: u64,
        local_port: u32,
    },
    PduftDel {
        ipcp_id: u16,
        dest_addr: u64,
    },
    PduftFlush {
        ipcp_id: u16,
    },
    SetFlags {
        subscribe_ipcp_updates: bool,
    },
    GenericResp {
        result: i32,
    },
}

/// Flow specification requested by the client at FA_REQ time. Kept opaque
/// (no DTP-level meaning) since QoS/DTP negotiation is out of scope (§1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSpec {
    pub max_sdu_size: u32,
    pub avg_bandwidth: u64,
    pub in_order_delivery: bool,
}

/// A fully decoded control message: header plus body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtrlMessage {
    pub header: Header,
    pub body: Body,
}

impl CtrlMessage {
    pub fn new(msg_type: MsgType, event_id: u32, body: Body) -> Self {
        Self {
            header: Header {
                msg_type: msg_type as u16,
                event_id,
            },
            body,
        }
    }

    /// Serializes this message to bytes using bincode, the same compact
    /// binary encoding the teacher uses for its `Message` type.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| Error::Invalid(format!("serialization failed: {e}")))
    }

    /// Decodes bytes produced by `to_bytes`. Fails with `Error::Invalid`
    /// ("malformed") if the buffer does not match the declared schema.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let msg: Self = bincode::deserialize(bytes)
            .map_err(|e| Error::Invalid(format!("malformed message: {e}")))?;
        // Validate the type tag is in range even though the body already
        // decoded successfully, to reject a well-formed-but-unknown type.
        MsgType::from_u16(msg.header.msg_type)?;
        Ok(msg)
    }
}
