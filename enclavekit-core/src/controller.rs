//! Per-request orchestration: picks a user-verification method and builds
//! exactly one enclave credential request from the manager's state.
//!
//! One [`EnclaveRequestController`] drives one `create` or `get` operation.
//! The UI flow around it is out of scope here; this is the boundary where the
//! manager's accessors and signing callbacks are assembled into a request for
//! the transaction client.

use crate::error::{EnclaveError, EnclaveResult};
use crate::manager::{EnclaveManager, UvKeyState};
use crate::platform::SigningHandle;
use crate::types::SecretVersion;

/// The relying party's user-verification requirement for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserVerificationRequirement {
    /// User verification should be skipped if possible.
    Discouraged,
    /// User verification is wanted but optional.
    Preferred,
    /// The request fails without user verification.
    Required,
}

/// How (or whether) the user will be verified for one enclave request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum UserVerificationMethod {
    /// No user verification.
    None,
    /// Verification via the wrapped PIN.
    Pin,
    /// Implicit verification: the device was registered during this request,
    /// which itself required the user to pass a verification step, so the raw
    /// secret still in memory vouches for them.
    Implicit,
    /// The user-verifying key signs; the OS shows the prompt.
    UvKeyWithSystemUi,
    /// The user-verifying key signs; the browser shows the prompt.
    UvKeyWithChromeUi,
    /// The requirement cannot be met with the available material.
    Unsatisfiable,
}

/// Decides the user-verification method from the request's requirement and
/// the account's available material.
#[must_use]
pub const fn pick_user_verification_method(
    requirement: UserVerificationRequirement,
    have_added_device: bool,
    has_pin: bool,
    uv_key_state: UvKeyState,
) -> UserVerificationMethod {
    match requirement {
        UserVerificationRequirement::Discouraged => UserVerificationMethod::None,
        UserVerificationRequirement::Preferred | UserVerificationRequirement::Required => {
            match uv_key_state {
                UvKeyState::None => {
                    if have_added_device {
                        UserVerificationMethod::Implicit
                    } else if has_pin {
                        UserVerificationMethod::Pin
                    } else if matches!(requirement, UserVerificationRequirement::Preferred) {
                        UserVerificationMethod::None
                    } else {
                        UserVerificationMethod::Unsatisfiable
                    }
                }
                UvKeyState::UsesSystemUi => UserVerificationMethod::UvKeyWithSystemUi,
                UvKeyState::UsesChromeUi => UserVerificationMethod::UvKeyWithChromeUi,
            }
        }
    }
}

/// Which passkey operation the request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// Create a new passkey.
    MakeCredential,
    /// Assert an existing passkey.
    GetAssertion,
}

/// A passkey known to the client, as far as this layer cares: its id and the
/// secret epoch it was created under.
#[derive(Debug, Clone)]
pub struct PasskeyEntity {
    /// The credential id.
    pub credential_id: Vec<u8>,
    /// Secret version the passkey was encrypted under, when recorded.
    pub key_version: Option<SecretVersion>,
}

/// One fully assembled enclave credential request.
///
/// Exactly one of `wrapped_secret` and `raw_secret` is populated: the enclave
/// either unwraps the secret itself or, immediately after registration, is
/// handed the raw secret that is still in memory.
pub struct CredentialRequest {
    /// Access token authenticating the transaction.
    pub access_token: String,
    /// Signer proving device identity.
    pub signing: SigningHandle,
    /// Hashed PIN claim, present only for [`UserVerificationMethod::Pin`].
    pub claimed_pin: Option<Vec<u8>>,
    /// Enclave-wrapped security-domain secret.
    pub wrapped_secret: Option<Vec<u8>>,
    /// Raw security-domain secret.
    pub raw_secret: Option<Vec<u8>>,
    /// Version of the supplied secret, when known.
    pub key_version: Option<SecretVersion>,
    /// The asserted passkey, for get requests.
    pub entity: Option<PasskeyEntity>,
}

/// Builds one enclave request per instantiation.
pub struct EnclaveRequestController {
    manager: EnclaveManager,
    request_type: RequestType,
    uv_requirement: UserVerificationRequirement,
    has_pin: bool,
    have_added_device: bool,
    creds: Vec<PasskeyEntity>,
}

impl EnclaveRequestController {
    /// Creates a controller for one request. `creds` is the set of passkeys
    /// for the relying party, consulted for get requests.
    #[must_use]
    pub fn new(
        manager: EnclaveManager,
        request_type: RequestType,
        uv_requirement: UserVerificationRequirement,
        has_pin: bool,
        creds: Vec<PasskeyEntity>,
    ) -> Self {
        Self {
            manager,
            request_type,
            uv_requirement,
            has_pin,
            have_added_device: false,
            creds,
        }
    }

    /// Records that the device registered during this request, enabling
    /// implicit user verification via the still-in-memory raw secret.
    pub fn device_added(&mut self) {
        self.have_added_device = true;
    }

    /// The user-verification method this request will use.
    #[must_use]
    pub fn user_verification_method(&self) -> UserVerificationMethod {
        pick_user_verification_method(
            self.uv_requirement,
            self.have_added_device,
            self.has_pin,
            self.manager.uv_key_state(),
        )
    }

    /// Assembles the credential request.
    ///
    /// `claimed_pin` must be supplied when the method is
    /// [`UserVerificationMethod::Pin`]; `selected_credential_id` must name
    /// one of the controller's credentials for get requests.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::NotReady`] when the verification requirement
    /// is unsatisfiable or the manager lacks the needed material.
    pub fn build_request(
        &self,
        access_token: String,
        claimed_pin: Option<Vec<u8>>,
        selected_credential_id: Option<&[u8]>,
    ) -> EnclaveResult<CredentialRequest> {
        let method = self.user_verification_method();
        let (signing, claimed_pin) = match method {
            UserVerificationMethod::None | UserVerificationMethod::Implicit => (
                self.manager
                    .hardware_key_signing_callback()
                    .ok_or(EnclaveError::NotReady("device is not registered"))?,
                None,
            ),
            UserVerificationMethod::Pin => (
                self.manager
                    .hardware_key_signing_callback()
                    .ok_or(EnclaveError::NotReady("device is not registered"))?,
                Some(claimed_pin.ok_or(EnclaveError::NotReady("pin claim missing"))?),
            ),
            UserVerificationMethod::UvKeyWithSystemUi
            | UserVerificationMethod::UvKeyWithChromeUi => (
                self.manager
                    .user_verifying_key_signing_callback()
                    .ok_or(EnclaveError::NotReady("user-verifying key unavailable"))?,
                None,
            ),
            UserVerificationMethod::Unsatisfiable => {
                return Err(EnclaveError::NotReady(
                    "user verification requirement cannot be satisfied",
                ));
            }
        };
        let use_raw_secret = method == UserVerificationMethod::Implicit;

        let mut request = CredentialRequest {
            access_token,
            signing,
            claimed_pin,
            wrapped_secret: None,
            raw_secret: None,
            key_version: None,
            entity: None,
        };
        match self.request_type {
            RequestType::MakeCredential => {
                if use_raw_secret {
                    let (version, secret) = self
                        .manager
                        .take_secret()
                        .ok_or(EnclaveError::NotReady("no raw secret retained"))?;
                    request.key_version = Some(version);
                    request.raw_secret = Some(secret);
                } else {
                    let (version, wrapped) = self
                        .manager
                        .get_current_wrapped_secret()
                        .ok_or(EnclaveError::NotReady("no wrapped secret held"))?;
                    request.key_version = Some(version);
                    request.wrapped_secret = Some(wrapped);
                }
            }
            RequestType::GetAssertion => {
                let selected =
                    selected_credential_id.ok_or(EnclaveError::NotReady("no credential selected"))?;
                let entity = self
                    .creds
                    .iter()
                    .find(|cred| cred.credential_id == selected)
                    .cloned()
                    .ok_or(EnclaveError::NotReady("selected credential unknown"))?;
                if use_raw_secret {
                    let (_, secret) = self
                        .manager
                        .take_secret()
                        .ok_or(EnclaveError::NotReady("no raw secret retained"))?;
                    request.raw_secret = Some(secret);
                } else {
                    // Prefer the epoch the passkey was created under; fall
                    // back to the newest wrapped secret.
                    let wrapped = entity
                        .key_version
                        .and_then(|version| {
                            let wrapped = self.manager.get_wrapped_secret(version);
                            if wrapped.is_none() {
                                tracing::error!(version, "no wrapped secret for passkey's epoch");
                            }
                            wrapped
                        })
                        .or_else(|| self.manager.get_current_wrapped_secret().map(|(_, w)| w))
                        .ok_or(EnclaveError::NotReady("no wrapped secret held"))?;
                    request.wrapped_secret = Some(wrapped);
                }
                request.entity = Some(entity);
            }
        }
        debug_assert!(request.wrapped_secret.is_some() != request.raw_secret.is_some());
        Ok(request)
    }
}
