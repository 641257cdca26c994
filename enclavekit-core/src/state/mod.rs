//! Persisted local state: one record per account, plus the invariants that
//! are enforced on every load and before every write.

pub mod file;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{AccountId, SecretVersion, StoreKeysArgs};

/// Schema version of the persisted record. Bumped on incompatible changes;
/// an unknown version is treated like corruption (state reset).
pub const LOCAL_STATE_VERSION: u32 = 1;

/// Per-account registration bookkeeping.
///
/// Field pairs are either empty together or populated together; see
/// [`check_invariants`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Public half of the device's hardware-backed identity key.
    pub hardware_public_key: Vec<u8>,
    /// Wrapped private half of the identity key, loadable only through the
    /// hardware key provider.
    pub wrapped_hardware_private_key: Vec<u8>,
    /// Device identifier derived from the hardware public key.
    pub device_id: Vec<u8>,
    /// Public half of the optional user-verifying key.
    pub uv_public_key: Vec<u8>,
    /// Reference to the user-verifying key. Platform keystores address UV
    /// keys by label, so this holds the UTF-8 label rather than key material.
    pub wrapped_uv_private_key: Vec<u8>,
    /// True once the device has registered with the enclave.
    pub registered: bool,
    /// Enclave-wrapped private half of the security-domain member key.
    pub wrapped_member_private_key: Vec<u8>,
    /// Public half of the security-domain member key.
    pub member_public_key: Vec<u8>,
    /// Enclave-wrapped copy of every secret epoch this client has learned
    /// about, keyed by version.
    pub wrapped_security_domain_secrets: BTreeMap<SecretVersion, Vec<u8>>,
    /// True once the member key has been registered with the security-domain
    /// service.
    pub joined: bool,
}

impl UserRecord {
    /// The version of the newest wrapped secret, if any.
    #[must_use]
    pub fn current_secret_version(&self) -> Option<SecretVersion> {
        self.wrapped_security_domain_secrets.keys().next_back().copied()
    }
}

/// Checks every invariant of a [`UserRecord`], returning a description of the
/// first failing clause.
///
/// # Errors
///
/// Returns the failing clause. A failure anywhere resets the entire local
/// state; corruption containment is preferred over partial recovery.
pub fn check_invariants(user: &UserRecord) -> Result<(), &'static str> {
    if user.wrapped_hardware_private_key.is_empty() != user.hardware_public_key.is_empty() {
        return Err("hardware key halves must be empty or populated together");
    }
    if user.wrapped_hardware_private_key.is_empty() != user.device_id.is_empty() {
        return Err("device id must be present exactly when the hardware key is");
    }
    if user.wrapped_uv_private_key.is_empty() != user.uv_public_key.is_empty() {
        return Err("user-verifying key halves must be empty or populated together");
    }
    if user.registered && user.wrapped_hardware_private_key.is_empty() {
        return Err("registered requires a hardware key");
    }
    if user.registered == user.wrapped_member_private_key.is_empty() {
        return Err("registered must match member key presence");
    }
    if user.wrapped_member_private_key.is_empty() != user.member_public_key.is_empty() {
        return Err("member key halves must be empty or populated together");
    }
    if user.joined && !user.registered {
        return Err("joined requires registered");
    }
    Ok(())
}

/// The process-wide persisted record: one [`UserRecord`] per account.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalState {
    /// Schema version, always [`LOCAL_STATE_VERSION`].
    pub version: u32,
    /// Per-account records, keyed by account id.
    pub users: BTreeMap<AccountId, UserRecord>,
}

impl LocalState {
    /// Creates an empty state at the current schema version.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: LOCAL_STATE_VERSION,
            users: BTreeMap::new(),
        }
    }

    /// The record for `account`, if one exists.
    #[must_use]
    pub fn user(&self, account: &AccountId) -> Option<&UserRecord> {
        self.users.get(account)
    }

    /// The record for `account`, created empty if absent.
    pub fn user_mut_or_default(&mut self, account: &AccountId) -> &mut UserRecord {
        self.users.entry(account.clone()).or_default()
    }

    /// Checks the invariants of every record.
    ///
    /// # Errors
    ///
    /// Returns the first failing clause across all records.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        if self.version != LOCAL_STATE_VERSION {
            return Err("unknown schema version");
        }
        for user in self.users.values() {
            check_invariants(user)?;
        }
        Ok(())
    }
}

/// Computes which of the secrets in `args` are not yet wrapped for `user`.
///
/// `args.keys` covers the version window ending at `args.last_key_version`,
/// ordered oldest first. Versions already present in the record are skipped.
#[must_use]
pub fn new_secrets_to_store(
    user: &UserRecord,
    args: &StoreKeysArgs,
) -> BTreeMap<SecretVersion, Vec<u8>> {
    let mut new_secrets = BTreeMap::new();
    if args.keys.is_empty() {
        return new_secrets;
    }
    let count = SecretVersion::try_from(args.keys.len()).unwrap_or(SecretVersion::MAX);
    let first_version = args.last_key_version.saturating_sub(count - 1);
    for (offset, key) in args.keys.iter().enumerate() {
        let Some(version) = SecretVersion::try_from(offset)
            .ok()
            .and_then(|o| first_version.checked_add(o))
        else {
            continue;
        };
        if version > args.last_key_version {
            break;
        }
        if !user.wrapped_security_domain_secrets.contains_key(&version) {
            new_secrets.insert(version, key.clone());
        }
    }
    new_secrets
}
