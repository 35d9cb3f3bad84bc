//! Per-IPCP application registration table (§4.F).
//!
//! Mirrors the kernel's `registered_appl` tracking off `struct ipcp`: one
//! entry per registered application name, owned by the control device that
//! issued the `APPL_REGISTER`. Registration is a two-phase handshake when a
//! uipcp is involved (PENDING until `APPL_REGISTER_RESP` arrives) but can
//! also complete synchronously when the IPCP's factory handles it in
//! process (§4.E `appl_register`).

use crate::error::{Error, Result};
use crate::message::ApplName;
use std::collections::HashMap;

/// Opaque identity of the control device/connection that owns a
/// registration, used to reject cross-connection unregister attempts and to
/// drive the steal-and-cleanup sweep on connection close.
pub type OwnerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    /// Registration request sent to (or awaiting) the uipcp.
    Pending,
    /// Registration acknowledged.
    Complete,
}

struct Entry {
    owner: OwnerId,
    state: RegState,
}

/// Registered-application table for one IPCP.
#[derive(Default)]
pub struct AppRegistry {
    entries: HashMap<ApplName, Entry>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins registering `appl` for `owner`.
    ///
    /// - Already registered by the *same* owner: idempotent success (the
    ///   kernel source's "request is already registered by this rc" no-op).
    /// - Already registered by a *different* owner: `Error::Busy`.
    /// - Otherwise inserts a new `Pending` entry.
    pub fn begin_register(&mut self, appl: &ApplName, owner: OwnerId) -> Result<()> {
        if let Some(existing) = self.entries.get(appl) {
            if existing.owner == owner {
                return Ok(());
            }
            return Err(Error::Busy(format!(
                "application '{appl}' already registered by another control device"
            )));
        }
        self.entries.insert(
            appl.clone(),
            Entry {
                owner,
                state: RegState::Pending,
            },
        );
        Ok(())
    }

    /// Applies an `APPL_REGISTER_RESP`. A `reg = false` response is a no-op
    /// per §9 Open Question b: the registration attempt is simply left
    /// pending (or, if already complete, untouched) and the caller logs a
    /// warning; a `reg = true` response completes the pending entry.
    pub fn complete_register(&mut self, appl: &ApplName, accepted: bool) -> Result<()> {
        let entry = self
            .entries
            .get_mut(appl)
            .ok_or_else(|| Error::Invalid(format!("no pending registration for '{appl}'")))?;
        if accepted {
            entry.state = RegState::Complete;
        }
        Ok(())
    }

    /// Unregisters `appl` on behalf of `owner`. Fails with `Error::Invalid`
    /// if not registered, `Error::Busy` if registered by someone else.
    pub fn unregister(&mut self, appl: &ApplName, owner: OwnerId) -> Result<()> {
        match self.entries.get(appl) {
            None => Err(Error::Invalid(format!("application '{appl}' not registered"))),
            Some(e) if e.owner != owner => Err(Error::Busy(format!(
                "application '{appl}' is owned by another control device"
            ))),
            Some(_) => {
                self.entries.remove(appl);
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, appl: &ApplName) -> bool {
        matches!(
            self.entries.get(appl),
            Some(Entry {
                state: RegState::Complete,
                ..
            })
        )
    }

    pub fn state(&self, appl: &ApplName) -> Option<RegState> {
        self.entries.get(appl).map(|e| e.state)
    }

    /// The control device that owns `appl`'s registration, if any.
    pub fn owner_of(&self, appl: &ApplName) -> Option<OwnerId> {
        self.entries.get(appl).map(|e| e.owner)
    }

    /// Steals every registration owned by `owner`, removing it from the
    /// table and returning each application name with the state it was in,
    /// so the caller can run their own teardown (factory notification,
    /// broadcaster update) outside this table's lock (§4.F
    /// "control-device-close cleanup"). Only a `Complete` entry ever reached
    /// an uipcp's shadow state, so only those should generate a close-time
    /// `APPL_REGISTER{reg:false}` notification; a still-`Pending` entry was
    /// never confirmed and the uipcp has no record of it to revoke.
    pub fn take_owned_by(&mut self, owner: OwnerId) -> Vec<(ApplName, RegState)> {
        let names: Vec<(ApplName, RegState)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(name, e)| (name.clone(), e.state))
            .collect();
        for (name, _) in &names {
            self.entries.remove(name);
        }
        names
    }

    pub fn iter_complete(&self) -> impl Iterator<Item = &ApplName> {
        self.entries.iter().filter_map(|(name, e)| {
            matches!(e.state, RegState::Complete).then_some(name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reregistering_same_owner_is_idempotent() {
        let mut r = AppRegistry::new();
        r.begin_register(&ApplName::new("a"), 1).unwrap();
        assert!(r.begin_register(&ApplName::new("a"), 1).is_ok());
    }

    #[test]
    fn registering_by_different_owner_is_rejected() {
        let mut r = AppRegistry::new();
        r.begin_register(&ApplName::new("a"), 1).unwrap();
        assert!(matches!(
            r.begin_register(&ApplName::new("a"), 2),
            Err(Error::Busy(_))
        ));
    }

    #[test]
    fn negative_response_leaves_entry_pending_without_error() {
        let mut r = AppRegistry::new();
        let name = ApplName::new("a");
        r.begin_register(&name, 1).unwrap();
        r.complete_register(&name, false).unwrap();
        assert_eq!(r.state(&name), Some(RegState::Pending));
        assert!(!r.is_registered(&name));
    }

    #[test]
    fn unregister_by_non_owner_is_rejected() {
        let mut r = AppRegistry::new();
        let name = ApplName::new("a");
        r.begin_register(&name, 1).unwrap();
        r.complete_register(&name, true).unwrap();
        assert!(matches!(r.unregister(&name, 2), Err(Error::Busy(_))));
        assert!(r.unregister(&name, 1).is_ok());
    }

    #[test]
    fn connection_close_steals_only_that_owners_registrations() {
        let mut r = AppRegistry::new();
        r.begin_register(&ApplName::new("a"), 1).unwrap();
        r.begin_register(&ApplName::new("b"), 2).unwrap();
        let stolen = r.take_owned_by(1);
        assert_eq!(stolen, vec![(ApplName::new("a"), RegState::Pending)]);
        assert!(r.state(&ApplName::new("b")).is_some());
        assert!(r.state(&ApplName::new("a")).is_none());
    }

    #[test]
    fn take_owned_by_reports_each_entrys_state() {
        let mut r = AppRegistry::new();
        r.begin_register(&ApplName::new("a"), 1).unwrap();
        r.complete_register(&ApplName::new("a"), true).unwrap();
        r.begin_register(&ApplName::new("b"), 1).unwrap();
        let mut stolen = r.take_owned_by(1);
        stolen.sort_by(|a: &(ApplName, RegState), b: &(ApplName, RegState)| {
            a.0.process_name.cmp(&b.0.process_name)
        });
        assert_eq!(
            stolen,
            vec![
                (ApplName::new("a"), RegState::Complete),
                (ApplName::new("b"), RegState::Pending),
            ]
        );
    }
}
