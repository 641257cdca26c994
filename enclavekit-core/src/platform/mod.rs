//! Capability-provider traits the enclave client depends on.
//!
//! The state machine is platform-agnostic; everything that touches the OS or
//! the network is abstracted behind a trait here:
//!
//! - [`StateCipher`] — OS encryption for the persisted state blob
//! - [`HardwareKeyProvider`] — hardware-backed identity signing keys
//! - [`UserVerifyingKeyProvider`] — optional biometric/PIN-gated signing keys
//! - [`IdentityProvider`] — the primary account and cookie-jar account list
//! - [`AccessTokenProvider`] — OAuth-style tokens for the enclave service
//! - [`EnclaveTransport`] — the transactional request/response exchange
//! - [`SecurityDomainClient`] — member registration with the security domain
//!
//! Synchronous traits perform blocking work and are always called from a
//! worker pool, never from the state machine's owning task. The network-facing
//! traits are async.

pub mod memory;

use std::sync::Arc;

use crate::error::EnclaveResult;
use crate::types::{AccountId, ClientKeyType, ClientSignature, JoinStatus, SecretVersion};

/// OS-provided encryption for data at rest.
///
/// Implementations should bind the key to the OS user (DPAPI, Keychain,
/// kwallet/libsecret). The blob written to disk is entirely opaque to the
/// enclave client.
pub trait StateCipher: Send + Sync {
    /// Encrypts `plaintext` with the OS-bound key.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS facility is unavailable or rejects the
    /// request.
    fn seal(&self, plaintext: &[u8]) -> EnclaveResult<Vec<u8>>;

    /// Decrypts a blob produced by [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// Returns an error on authentication failure or malformed input.
    fn open(&self, ciphertext: &[u8]) -> EnclaveResult<Vec<u8>>;
}

/// A loaded hardware-backed signing key.
///
/// The private half never leaves the provider; only the wrapped form is
/// observable and persistable.
pub trait HardwareSigningKey: Send {
    /// The public key, encoded as a SubjectPublicKeyInfo structure.
    fn public_key_info(&self) -> Vec<u8>;

    /// The wrapped private key, suitable for [`HardwareKeyProvider::from_wrapped`].
    fn wrapped_key(&self) -> Vec<u8>;

    /// Signs `message`. Slow; must be called off the owning task.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying key is no longer usable.
    fn sign(&self, message: &[u8]) -> EnclaveResult<Vec<u8>>;
}

/// Provider of hardware-backed signing keys usable without user interaction.
pub trait HardwareKeyProvider: Send + Sync {
    /// Generates a fresh signing key. Slow.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform has no usable key store.
    fn generate(&self) -> EnclaveResult<Box<dyn HardwareSigningKey>>;

    /// Reloads a key from its wrapped form. Slow.
    ///
    /// # Errors
    ///
    /// Returns an error if the wrapped blob no longer corresponds to a
    /// loadable key. Hardware key stores do lose keys in practice; callers
    /// must treat this as recoverable.
    fn from_wrapped(&self, wrapped: &[u8]) -> EnclaveResult<Box<dyn HardwareSigningKey>>;
}

/// A loaded user-verifying signing key. Signing triggers OS-level user
/// verification (biometric or PIN).
pub trait UserVerifyingKey: Send {
    /// The label this key is stored under.
    fn label(&self) -> &str;

    /// The public key, encoded as a SubjectPublicKeyInfo structure.
    fn public_key_info(&self) -> Vec<u8>;

    /// Signs `message` after the OS verifies the user. Slow, may show UI.
    ///
    /// # Errors
    ///
    /// Returns an error if verification fails or the key is gone.
    fn sign(&self, message: &[u8]) -> EnclaveResult<Vec<u8>>;
}

/// Provider of user-verifying signing keys, addressed by label.
///
/// A platform without user-verification support simply provides no
/// implementation; the enclave client treats the capability as optional.
pub trait UserVerifyingKeyProvider: Send + Sync {
    /// Creates (or replaces) the key stored under `label`. Slow.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be created.
    fn generate(&self, label: &str) -> EnclaveResult<Box<dyn UserVerifyingKey>>;

    /// Loads the key stored under `label`. Slow.
    ///
    /// # Errors
    ///
    /// Returns an error if no key exists under `label`.
    fn load(&self, label: &str) -> EnclaveResult<Box<dyn UserVerifyingKey>>;
}

/// Read-only view of the browser-level account state.
pub trait IdentityProvider: Send + Sync {
    /// The current primary account, if any.
    fn primary_account(&self) -> Option<AccountId>;

    /// Every account currently in the cookie jar (signed in or out), or
    /// `None` when the list is not fresh. Reconciliation is skipped on a
    /// stale list.
    fn accounts_in_cookie_jar(&self) -> Option<Vec<AccountId>>;
}

/// Fetches OAuth-style access tokens for the enclave service.
#[async_trait::async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Fetches a token for the primary account.
    ///
    /// # Errors
    ///
    /// Returns an error on auth or network failure; the current high-level
    /// request is abandoned.
    async fn fetch_token(&self) -> EnclaveResult<String>;
}

/// The transactional request/response exchange with the remote enclave.
///
/// A request is an ordered array of command maps; a successful exchange
/// yields a response array of equal length. The wire encoding beyond that is
/// opaque to the state machine.
#[async_trait::async_trait]
pub trait EnclaveTransport: Send + Sync {
    /// Performs one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange could not be completed at all;
    /// per-command failures are reported inside the response array.
    async fn transact(
        &self,
        access_token: String,
        request: ciborium::Value,
        signer: Option<SigningHandle>,
    ) -> EnclaveResult<ciborium::Value>;
}

/// Client of the trusted-vault security-domain service.
#[async_trait::async_trait]
pub trait SecurityDomainClient: Send + Sync {
    /// Registers `member_public_key` as a new member of `account`'s security
    /// domain, supplying the full ordered list of known raw secrets (newest
    /// last) so the server can accept the device at any epoch it knows.
    async fn register_member(
        &self,
        account: &AccountId,
        member_public_key: &[u8],
        secrets: &[Vec<u8>],
        last_key_version: SecretVersion,
    ) -> JoinStatus;
}

enum SigningKeySpec {
    Hardware {
        wrapped_key: Vec<u8>,
        provider: Arc<dyn HardwareKeyProvider>,
    },
    UserVerifying {
        label: String,
        provider: Arc<dyn UserVerifyingKeyProvider>,
    },
}

/// A one-shot signer over enclave requests.
///
/// Bundles the persisted key reference with its provider so that callers can
/// sign without access to the manager's internals. Key loading and signing
/// run on the blocking pool; any failure is reported as `None`, never a
/// panic. From the caller's perspective a device whose key is gone is simply
/// no longer registered.
pub struct SigningHandle {
    key: SigningKeySpec,
    device_id: Vec<u8>,
}

impl SigningHandle {
    /// Creates a handle that signs with the hardware-backed identity key.
    #[must_use]
    pub fn hardware(
        wrapped_key: Vec<u8>,
        device_id: Vec<u8>,
        provider: Arc<dyn HardwareKeyProvider>,
    ) -> Self {
        Self {
            key: SigningKeySpec::Hardware {
                wrapped_key,
                provider,
            },
            device_id,
        }
    }

    /// Creates a handle that signs with the user-verifying key.
    #[must_use]
    pub fn user_verifying(
        label: String,
        device_id: Vec<u8>,
        provider: Arc<dyn UserVerifyingKeyProvider>,
    ) -> Self {
        Self {
            key: SigningKeySpec::UserVerifying { label, provider },
            device_id,
        }
    }

    /// Which class of key this handle signs with.
    #[must_use]
    pub const fn key_type(&self) -> ClientKeyType {
        match self.key {
            SigningKeySpec::Hardware { .. } => ClientKeyType::Hardware,
            SigningKeySpec::UserVerifying { .. } => ClientKeyType::UserVerified,
        }
    }

    /// Loads the key and signs `message` on the blocking pool.
    ///
    /// Returns `None` on any key-load or signing failure.
    pub async fn sign(&self, message: Vec<u8>) -> Option<ClientSignature> {
        let device_id = self.device_id.clone();
        let key_type = self.key_type();
        let task = match &self.key {
            SigningKeySpec::Hardware {
                wrapped_key,
                provider,
            } => {
                let wrapped_key = wrapped_key.clone();
                let provider = Arc::clone(provider);
                tokio::task::spawn_blocking(move || {
                    provider.from_wrapped(&wrapped_key)?.sign(&message)
                })
            }
            SigningKeySpec::UserVerifying { label, provider } => {
                let label = label.clone();
                let provider = Arc::clone(provider);
                tokio::task::spawn_blocking(move || provider.load(&label)?.sign(&message))
            }
        };
        match task.await {
            Ok(Ok(signature)) => Some(ClientSignature {
                device_id,
                signature,
                key_type,
            }),
            Ok(Err(err)) => {
                tracing::error!("signing failed: {err}");
                None
            }
            Err(err) => {
                tracing::error!("signing task panicked: {err}");
                None
            }
        }
    }
}
