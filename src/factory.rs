//! IPCP factory plugin contract and process-wide registry (§4.E, §6).
//!
//! A factory provides the datapath behavior for one DIF type (e.g. "normal",
//! a shim). The core never looks inside a factory's private state; it only
//! calls the trait methods, under the per-IPCP mutex except for
//! `sdu_write`/`sdu_rx` which the real datapath would run outside any core
//! lock. Since PDU encoding/decoding is explicitly out of scope (§1),
//! `sdu_write`/`sdu_rx` are present on the trait for contract completeness
//! but are not exercised by the control-plane logic in this crate.

use crate::error::{Error, Result};
use crate::message::{ApplName, FlowSpec};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of a kernel-side (in-process) flow allocation attempt, when the
/// factory can answer synchronously instead of reflecting to a uipcp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The factory doesn't implement this hook; the core should try
    /// reflecting to the IPCP's uipcp instead.
    NotImplemented,
    Accepted,
    Refused,
}

/// Plugin contract every IPCP implementation (kernel-side or a thin shim
/// over a uipcp) must provide. Mirrors `struct ipcp_factory::ops` in the
/// kernel source.
#[async_trait]
pub trait Factory: Send + Sync {
    /// Human-readable DIF type this factory implements, e.g. `"normal"`.
    fn dif_type(&self) -> &str;

    /// Whether flows on IPCPs from this factory carry connection-endpoint
    /// ids (the `USE_CEP_IDS` flag in §3).
    fn use_cep_ids(&self) -> bool {
        false
    }

    /// Allocates factory-private state for a newly created IPCP.
    async fn create(&self, ipcp_id: u16) -> Result<()>;

    /// Tears down factory-private state. Called outside any core lock on
    /// the IPCP's last `put` (§4.D).
    async fn destroy(&self, ipcp_id: u16);

    /// Forwards an SDU write to the datapath. Out of scope for this core;
    /// default implementation reports unsupported.
    async fn sdu_write(&self, _ipcp_id: u16, _data: &[u8]) -> Result<()> {
        Err(Error::Unsupported("sdu_write not implemented".into()))
    }

    /// Kernel-side (synchronous, in-process) application registration hook.
    /// Returns `NotImplemented` if this factory has no kernel-side
    /// registration and the core should rely on a uipcp instead.
    async fn appl_register(&self, _ipcp_id: u16, _appl: &ApplName) -> SyncOutcome {
        SyncOutcome::NotImplemented
    }

    /// Kernel-side flow allocation request hook (client side, §4.G step 1).
    async fn flow_allocate_req(
        &self,
        _ipcp_id: u16,
        _local: &ApplName,
        _remote: &ApplName,
        _spec: &FlowSpec,
    ) -> SyncOutcome {
        SyncOutcome::NotImplemented
    }

    /// Kernel-side flow allocation response hook (server side, §4.G step 3).
    async fn flow_allocate_resp(&self, _ipcp_id: u16, _port_id: u32, _accept: bool) {}

    /// Called from the worker when a flow is finally torn down (§4.D).
    async fn flow_deallocated(&self, _ipcp_id: u16, _port_id: u32) {}

    /// Applies a config parameter the core itself does not recognize.
    async fn config(&self, _ipcp_id: u16, _param: &str, _value: &str) -> Result<()> {
        Err(Error::Unsupported("unknown config parameter".into()))
    }

    /// Reads back a config parameter the core itself does not recognize.
    async fn config_get(&self, _ipcp_id: u16, _param: &str) -> Result<String> {
        Err(Error::Unsupported("unknown config parameter".into()))
    }

    /// PDU forwarding table mutation (all-or-nothing cluster, §6). Out of
    /// scope for datapath purposes but present so the dispatcher has
    /// somewhere to route PDUFT_* messages.
    async fn pduft_set(&self, _ipcp_id: u16, _dest_addr: u64, _local_port: u32) -> Result<()> {
        Err(Error::Unsupported("pduft not implemented".into()))
    }

    async fn pduft_del(&self, _ipcp_id: u16, _dest_addr: u64) -> Result<()> {
        Err(Error::Unsupported("pduft not implemented".into()))
    }

    async fn pduft_flush(&self, _ipcp_id: u16) -> Result<()> {
        Err(Error::Unsupported("pduft not implemented".into()))
    }

    fn qos_supported(&self, _qos_id: u32) -> bool {
        false
    }

    /// Self-reported completeness of this factory's op table (§4.E: reject
    /// "incomplete op tables — missing `destroy` or `sdu_write`, or a
    /// partial pduft-set without the matching pduft-del/flush"). Trait
    /// objects can't be introspected to tell a default method from an
    /// overridden one, so the check can't be done structurally the way the
    /// kernel's nullable-function-pointer vtable does it; a factory that
    /// overrides only some of a related group must override this to report
    /// `false` until the group is complete. Defaults to `true`.
    fn is_complete(&self) -> bool {
        true
    }
}

/// A no-op factory used by tests and the demo binary: every IPCP it backs
/// has no kernel-side hooks, so flow allocation and app registration always
/// reflect through to a uipcp. Stands in for the out-of-scope "normal IPCP"
/// datapath plugin (`rina-normal.c` in the original source).
pub struct NullIpcpFactory {
    ty: String,
}

impl NullIpcpFactory {
    pub fn new(ty: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { ty: ty.into() })
    }
}

#[async_trait]
impl Factory for NullIpcpFactory {
    fn dif_type(&self) -> &str {
        &self.ty
    }

    async fn create(&self, _ipcp_id: u16) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self, _ipcp_id: u16) {}
}

/// Process-wide set of IPCP factories keyed by DIF type (§4.E).
#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, Arc<dyn Factory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory`. Rejects a duplicate DIF type and a factory that
    /// reports its own op table incomplete (`Factory::is_complete`, §4.E).
    /// The factory object's ownership remains with the caller (we only hold
    /// an `Arc`).
    pub fn register(&mut self, factory: Arc<dyn Factory>) -> Result<()> {
        let ty = factory.dif_type().to_string();
        if self.factories.contains_key(&ty) {
            return Err(Error::Busy(format!(
                "factory for DIF type '{ty}' already registered"
            )));
        }
        if !factory.is_complete() {
            return Err(Error::Invalid(format!(
                "factory for DIF type '{ty}' reports an incomplete op table"
            )));
        }
        self.factories.insert(ty, factory);
        Ok(())
    }

    /// Removes the factory for `dif_type`, if any.
    pub fn unregister(&mut self, dif_type: &str) -> Result<()> {
        self.factories
            .remove(dif_type)
            .map(|_| ())
            .ok_or_else(|| Error::Invalid(format!("no factory for DIF type '{dif_type}'")))
    }

    pub fn find(&self, dif_type: &str) -> Option<Arc<dyn Factory>> {
        self.factories.get(dif_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_dif_type_is_rejected() {
        let mut reg = FactoryRegistry::new();
        reg.register(NullIpcpFactory::new("normal")).unwrap();
        assert!(reg.register(NullIpcpFactory::new("normal")).is_err());
    }

    struct IncompleteFactory;

    #[async_trait]
    impl Factory for IncompleteFactory {
        fn dif_type(&self) -> &str {
            "broken"
        }
        async fn create(&self, _ipcp_id: u16) -> Result<()> {
            Ok(())
        }
        async fn destroy(&self, _ipcp_id: u16) {}
        fn is_complete(&self) -> bool {
            false
        }
    }

    #[test]
    fn factory_reporting_incomplete_op_table_is_rejected() {
        let mut reg = FactoryRegistry::new();
        assert!(matches!(
            reg.register(Arc::new(IncompleteFactory)),
            Err(Error::Invalid(_))
        ));
    }
}
