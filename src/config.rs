//! Recognized `IPCP_CONFIG`/`IPCP_CONFIG_GET` parameters (§6).
//!
//! Parameters the core itself understands are applied directly to the
//! `Ipcp`'s fields; anything else is forwarded to the owning factory.

use crate::error::{Error, Result};
use crate::ipcp::Ipcp;

fn parse_u32(value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| Error::Invalid(format!("'{value}' is not a valid unsigned integer")))
}

fn parse_u64(value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::Invalid(format!("'{value}' is not a valid unsigned integer")))
}

/// Applies `param = value` to `ipcp`, synchronously. Returns
/// `Error::Unsupported` for a parameter neither the core nor the factory
/// recognizes (propagated verbatim from `Factory::config`).
pub async fn apply(ipcp: &Ipcp, param: &str, value: &str) -> Result<()> {
    match param {
        "txhdroom" => {
            *ipcp.txhdroom.lock() = parse_u32(value)?;
            Ok(())
        }
        "rxhdroom" => {
            *ipcp.rxhdroom.lock() = parse_u32(value)?;
            Ok(())
        }
        "mss" => {
            *ipcp.max_sdu_size.lock() = parse_u32(value)?;
            Ok(())
        }
        "flow-del-wait-ms" => {
            *ipcp.flow_del_wait_ms.lock() = parse_u64(value)?;
            Ok(())
        }
        other => ipcp.factory.config(ipcp.id, other, value).await,
    }
}

/// Reads back a previously applied parameter.
pub async fn get(ipcp: &Ipcp, param: &str) -> Result<String> {
    match param {
        "txhdroom" => Ok(ipcp.txhdroom.lock().to_string()),
        "rxhdroom" => Ok(ipcp.rxhdroom.lock().to_string()),
        "mss" => Ok(ipcp.max_sdu_size.lock().to_string()),
        "flow-del-wait-ms" => Ok(ipcp.flow_del_wait_ms.lock().to_string()),
        other => ipcp.factory.config_get(ipcp.id, other).await,
    }
}
