//! Core type definitions for the enclave client.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// An opaque account identifier (the service-side user id a record belongs
/// to).
///
/// Local state is keyed by account id, and every network operation is
/// performed on behalf of the primary account.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Creates an account id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of the account id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Version number of a security-domain secret epoch.
pub type SecretVersion = i32;

/// Which class of device key produced a [`ClientSignature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKeyType {
    /// The hardware-backed identity key, usable without user interaction.
    Hardware,
    /// The user-verifying key, gated by OS-level biometric/PIN confirmation.
    UserVerified,
}

/// A signature over an enclave request, proving device identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSignature {
    /// Identifier of the signing device.
    pub device_id: Vec<u8>,
    /// The raw signature bytes.
    pub signature: Vec<u8>,
    /// Which key produced the signature.
    pub key_type: ClientKeyType,
}

/// One pending batch of raw security-domain secrets handed to
/// [`StoreKeys`](crate::manager::EnclaveManager::store_keys).
///
/// Raw secrets are held only transiently; the buffer is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StoreKeysArgs {
    /// Account the secrets belong to. Batches for a non-primary account are
    /// discarded when processed.
    #[zeroize(skip)]
    pub account_id: AccountId,
    /// The raw secrets, ordered oldest first (newest last).
    pub keys: Vec<Vec<u8>>,
    /// The version number of the last (newest) entry of `keys`.
    pub last_key_version: SecretVersion,
}

impl fmt::Debug for StoreKeysArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreKeysArgs")
            .field("account_id", &self.account_id)
            .field("num_keys", &self.keys.len())
            .field("last_key_version", &self.last_key_version)
            .finish()
    }
}

/// Outcome of registering the member key with the security-domain service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum JoinStatus {
    /// The member key was accepted.
    Success,
    /// The member key was already registered with the domain.
    AlreadyRegistered,
    /// The server considers the local epoch bookkeeping stale.
    LocalDataObsolete,
    /// Transient failure fetching an access token for the join call.
    TransientAccessTokenFetchError,
    /// Persistent failure fetching an access token for the join call.
    PersistentAccessTokenFetchError,
    /// The primary account changed while fetching an access token.
    PrimaryAccountChangeAccessTokenFetchError,
    /// The join call failed at the network level.
    NetworkError,
    /// Any other server-side rejection.
    OtherError,
}

impl JoinStatus {
    /// Whether this status means the device is (now or already) a member of
    /// the security domain.
    #[must_use]
    pub const fn is_member(self) -> bool {
        matches!(self, Self::Success | Self::AlreadyRegistered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_display() {
        let id = AccountId::new("gaia1");
        assert_eq!(id.as_str(), "gaia1");
        assert_eq!(format!("{id}"), "gaia1");
        assert_eq!(format!("{id:?}"), "AccountId(gaia1)");
    }

    #[test]
    fn join_status_membership() {
        assert!(JoinStatus::Success.is_member());
        assert!(JoinStatus::AlreadyRegistered.is_member());
        assert!(!JoinStatus::NetworkError.is_member());
        assert!(!JoinStatus::OtherError.is_member());
    }

    #[test]
    fn store_keys_args_debug_hides_key_material() {
        let args = StoreKeysArgs {
            account_id: AccountId::new("gaia1"),
            keys: vec![vec![0xAA; 32]],
            last_key_version: 417,
        };
        let debug = format!("{args:?}");
        assert!(!debug.contains("170")); // 0xAA
        assert!(debug.contains("417"));
    }
}
