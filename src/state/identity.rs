//! # Identities: named principals with an access level.
//!
//! An [`Identity`] carries exactly one credential: a local peer uid or a
//! basic password hash. The state file serialises the full form including
//! secrets; [`Identity::redacted`] produces the form safe to hand to API
//! clients.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::state::store::State;

/// Access level of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityAccess {
    Admin,
    Read,
    Metrics,
    Untrusted,
}

/// Local (peer-credential) identity: matched by uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LocalIdentity {
    pub user_id: u32,
}

/// Basic-auth identity: password hash supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicIdentity {
    /// Password hash. Included in the state file, never in API output.
    pub password: String,
}

/// A named principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Identity {
    #[serde(skip)]
    pub name: String,
    pub access: IdentityAccess,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicIdentity>,
}

impl Identity {
    /// Checks the identity carries exactly one credential.
    pub fn validate(&self) -> Result<(), StateError> {
        match (&self.local, &self.basic) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(StateError::Invalid {
                message: format!(
                    "identity {:?} must have exactly one of \"local\" or \"basic\"",
                    self.name
                ),
            }),
        }
    }

    /// Copy with secrets blanked, for API responses.
    pub fn redacted(&self) -> Identity {
        let mut copy = self.clone();
        if let Some(basic) = &mut copy.basic {
            basic.password = "*****".to_string();
        }
        copy
    }
}

impl State {
    /// Adds named identities. Fails without mutating anything if any name
    /// already exists or any identity is invalid.
    pub fn add_identities(
        &mut self,
        identities: BTreeMap<String, Identity>,
    ) -> Result<(), StateError> {
        for (name, identity) in &identities {
            identity.validate()?;
            if self.identities.contains_key(name) {
                return Err(StateError::Invalid {
                    message: format!("identity {name:?} already exists"),
                });
            }
        }
        self.writing();
        for (name, mut identity) in identities {
            identity.name = name.clone();
            self.identities.insert(name, identity);
        }
        Ok(())
    }

    /// Removes named identities; fails if any name does not exist.
    pub fn remove_identities(&mut self, names: &[String]) -> Result<(), StateError> {
        for name in names {
            if !self.identities.contains_key(name) {
                return Err(StateError::NoState {
                    key: format!("identity {name}"),
                });
            }
        }
        self.writing();
        for name in names {
            self.identities.remove(name);
        }
        Ok(())
    }

    /// Looks up one identity.
    pub fn identity(&self, name: &str) -> Option<&Identity> {
        self.identities.get(name)
    }

    /// All identities by name.
    pub fn identities(&self) -> &BTreeMap<String, Identity> {
        &self.identities
    }
}
