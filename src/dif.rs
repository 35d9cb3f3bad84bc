//! DIF (Distributed IPC Facility) shared identity (§3).

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Default Maximum Packet Lifetime, milliseconds. Unused directly by the
/// core (datapath timing is out of scope) but kept on `Dif` since the
/// kernel source stores it there (`dif->max_pdu_life`) and factories may
/// read it for their own bookkeeping.
pub const MPL_MSECS_DEFAULT: u64 = 2000;

/// A DIF identity shared by every IPCP that has joined it.
pub struct Dif {
    pub name: String,
    pub ty: String,
    pub max_pdu_life_ms: u64,
}

/// Process-wide (well: per-DM) table of DIFs, refcounted by membership.
#[derive(Default)]
pub struct DifTable {
    entries: HashMap<String, (Arc<Dif>, usize)>,
}

impl DifTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins `dif_name`/`dif_type`, creating the DIF on first join and
    /// bumping its refcount otherwise. Fails with `Error::Invalid` if the
    /// name already exists under a different type.
    pub fn get_or_create(&mut self, dif_name: &str, dif_type: &str) -> Result<Arc<Dif>> {
        if let Some((dif, refcnt)) = self.entries.get_mut(dif_name) {
            if dif.ty != dif_type {
                return Err(Error::Invalid(format!(
                    "DIF '{dif_name}' already exists with type '{}', requested '{dif_type}'",
                    dif.ty
                )));
            }
            *refcnt += 1;
            return Ok(dif.clone());
        }

        let dif = Arc::new(Dif {
            name: dif_name.to_string(),
            ty: dif_type.to_string(),
            max_pdu_life_ms: MPL_MSECS_DEFAULT,
        });
        self.entries.insert(dif_name.to_string(), (dif.clone(), 1));
        Ok(dif)
    }

    /// Releases one reference to `dif_name`, destroying the entry when the
    /// refcount reaches zero.
    pub fn put(&mut self, dif_name: &str) {
        if let Some((_, refcnt)) = self.entries.get_mut(dif_name) {
            *refcnt -= 1;
            if *refcnt == 0 {
                self.entries.remove(dif_name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_type_is_rejected() {
        let mut t = DifTable::new();
        t.get_or_create("d1", "normal").unwrap();
        assert!(t.get_or_create("d1", "shim-eth").is_err());
    }

    #[test]
    fn refcount_destroys_on_last_put() {
        let mut t = DifTable::new();
        t.get_or_create("d1", "normal").unwrap();
        t.get_or_create("d1", "normal").unwrap();
        t.put("d1");
        assert!(t.entries.contains_key("d1"));
        t.put("d1");
        assert!(!t.entries.contains_key("d1"));
    }
}
