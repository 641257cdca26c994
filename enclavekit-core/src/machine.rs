//! The registration state machine.
//!
//! [`Machine`] is pure: [`Machine::step`] consumes one [`Event`] plus a
//! snapshot of the browser identity and returns the [`Effect`]s to execute.
//! All I/O (file loads, key generation, token fetches, enclave transactions,
//! domain joins, persistence) happens in the driver (see
//! [`manager`](crate::manager)), which feeds the results back in as the next
//! event. This keeps every transition unit-testable without a runtime.
//!
//! Main path:
//!
//! ```text
//! Init -> Idle -> { Loading,
//!                   GeneratingKeys -> WaitingForTokenForRegistration
//!                                  -> RegisteringWithEnclave,
//!                   WaitingForTokenForWrapping -> WrappingSecrets,
//!                   JoiningDomain } -> Idle
//! ```
//!
//! Every time an in-flight step completes the machine re-runs its next-action
//! decision, so queued requests are coalesced into the minimum number of
//! network operations.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::platform::{HardwareSigningKey, UserVerifyingKey};
use crate::state::{self, LocalState, UserRecord};
use crate::types::{AccountId, JoinStatus, SecretVersion, StoreKeysArgs};

/// The machine's current position in the registration flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum State {
    /// Created but not started; all events are ignored.
    Init,
    /// Nothing in flight.
    Idle,
    /// Reading and decrypting the persisted state file.
    Loading,
    /// Generating (or reloading) the device's signing keys.
    GeneratingKeys,
    /// Fetching an access token ahead of device registration.
    WaitingForTokenForRegistration,
    /// Registration transaction outstanding.
    RegisteringWithEnclave,
    /// Fetching an access token ahead of wrapping new secrets.
    WaitingForTokenForWrapping,
    /// Wrapping transaction outstanding.
    WrappingSecrets,
    /// Security-domain join call outstanding.
    JoiningDomain,
}

/// What the outside world reports back into the machine.
pub enum Event {
    /// Something may have changed: a new request was queued, the machine was
    /// started, or the identity was updated. Ignored unless idle.
    Poke,
    /// The outstanding asynchronous step failed.
    Failure,
    /// The decrypted state blob, or `None` when the file was absent or
    /// unreadable.
    FileContents(Option<Vec<u8>>),
    /// Key generation finished.
    KeysReady {
        /// The hardware-backed identity key.
        hardware: Box<dyn HardwareSigningKey>,
        /// The user-verifying key, when the platform provides one.
        uv: Option<Box<dyn UserVerifyingKey>>,
    },
    /// An access token was fetched.
    AccessToken(String),
    /// The enclave answered the outstanding transaction.
    EnclaveResponse(ciborium::Value),
    /// The security-domain service answered the outstanding join.
    Join(JoinStatus),
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Self::Poke => "Poke",
            Self::Failure => "Failure",
            Self::FileContents(_) => "FileContents",
            Self::KeysReady { .. } => "KeysReady",
            Self::AccessToken(_) => "AccessToken",
            Self::EnclaveResponse(_) => "EnclaveResponse",
            Self::Join(_) => "Join",
        }
    }
}

/// Identity of the signer for a transaction that must prove device identity.
pub struct TransactSigner {
    /// Wrapped hardware key, loadable through the hardware key provider.
    pub wrapped_key: Vec<u8>,
    /// The device identifier to attach to the signature.
    pub device_id: Vec<u8>,
}

/// I/O the driver must perform on the machine's behalf.
pub enum Effect {
    /// Read and decrypt the state file; report back as
    /// [`Event::FileContents`].
    LoadState,
    /// Generate or reload the device keys; report back as
    /// [`Event::KeysReady`] or [`Event::Failure`].
    GenerateKeys {
        /// Wrapped hardware key to reload, when one is already persisted.
        existing_hardware_key: Option<Vec<u8>>,
        /// Label of an existing user-verifying key to reload.
        existing_uv_label: Option<String>,
    },
    /// Fetch an access token; report back as [`Event::AccessToken`] or
    /// [`Event::Failure`].
    FetchAccessToken,
    /// Perform one enclave transaction; report back as
    /// [`Event::EnclaveResponse`] or [`Event::Failure`].
    Transact {
        /// The access token to authenticate with.
        token: String,
        /// The CBOR command array.
        request: ciborium::Value,
        /// Present when the request must be signed with the hardware key.
        signer: Option<TransactSigner>,
    },
    /// Register the member key with the security-domain service; report back
    /// as [`Event::Join`].
    JoinSecurityDomain {
        /// Account whose domain is being joined.
        account: AccountId,
        /// Public half of the member keypair.
        member_public_key: Vec<u8>,
        /// Every known raw secret, ordered oldest first.
        secrets: Vec<Vec<u8>>,
        /// Version of the newest entry of `secrets`.
        last_key_version: SecretVersion,
    },
    /// Write the encoded state blob to disk (sealed, merged with any write
    /// already in progress).
    PersistState(Vec<u8>),
    /// The machine went idle; wake anyone waiting on it.
    NotifyIdle,
}

impl Effect {
    fn name(&self) -> &'static str {
        match self {
            Self::LoadState => "LoadState",
            Self::GenerateKeys { .. } => "GenerateKeys",
            Self::FetchAccessToken => "FetchAccessToken",
            Self::Transact { .. } => "Transact",
            Self::JoinSecurityDomain { .. } => "JoinSecurityDomain",
            Self::PersistState(_) => "PersistState",
            Self::NotifyIdle => "NotifyIdle",
        }
    }
}

/// Point-in-time view of the browser's account state, sampled by the driver
/// immediately before each [`Machine::step`] call.
#[derive(Debug, Clone, Default)]
pub struct IdentitySnapshot {
    /// The primary account, if any.
    pub primary: Option<AccountId>,
    /// Accounts currently in the cookie jar, or `None` when not fresh.
    pub cookie_jar: Option<Vec<AccountId>>,
}

/// Scratch for an in-flight store-keys batch.
struct WrappingOp {
    /// The not-yet-wrapped subset, keyed by version.
    new_secrets: BTreeMap<SecretVersion, Vec<u8>>,
    /// The full batch, kept for the join call and the retained secret.
    args: StoreKeysArgs,
}

/// The pure registration state machine.
pub struct Machine {
    state: State,
    local: LocalState,
    loaded: bool,
    /// The account the machine last reconciled against. Distinct from the
    /// snapshot's primary until the next-action pass observes the change.
    active: Option<AccountId>,
    want_registration: bool,
    pending_store_keys: Option<StoreKeysArgs>,
    wrapping: Option<WrappingOp>,
    /// Raw newest secret of the last successfully processed batch, retained
    /// for implicit user verification. Cleared on identity change.
    retained_secret: Option<(SecretVersion, Vec<u8>)>,
    store_keys_count: u64,
    /// Incremented whenever in-flight work becomes stale (idle entry,
    /// identity change). The driver stamps spawned work with the generation
    /// it observed and drops results whose stamp no longer matches.
    generation: u64,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// Creates a machine in [`State::Init`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Init,
            local: LocalState::empty(),
            loaded: false,
            active: None,
            want_registration: false,
            pending_store_keys: None,
            wrapping: None,
            retained_secret: None,
            store_keys_count: 0,
            generation: 0,
        }
    }

    // -- request intake (no transitions; the driver pokes afterwards) -------

    /// Moves out of [`State::Init`]. Calling again is a no-op.
    pub fn start(&mut self) {
        if self.state == State::Init {
            self.state = State::Idle;
        }
    }

    /// Marks registration as desired. No-op once registered.
    pub fn request_registration(&mut self) {
        self.want_registration = true;
    }

    /// Queues a batch of raw secrets, replacing any unconsumed previous
    /// batch.
    pub fn queue_store_keys(&mut self, args: StoreKeysArgs) {
        if self.pending_store_keys.is_some() {
            tracing::warn!("replacing unconsumed store-keys batch");
        }
        self.pending_store_keys = Some(args);
    }

    // -- read accessors ------------------------------------------------------

    /// The current state.
    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// True when nothing is in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// True once the persisted state has been loaded.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// The current stale-work generation.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of store-keys batches fully processed.
    #[must_use]
    pub const fn store_keys_count(&self) -> u64 {
        self.store_keys_count
    }

    fn active_user(&self) -> Option<&UserRecord> {
        self.active.as_ref().and_then(|a| self.local.user(a))
    }

    /// True when the active user has registered with the enclave.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.active_user().is_some_and(|u| u.registered)
    }

    /// True when registered and at least one wrapped secret is held.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.active_user()
            .is_some_and(|u| u.registered && !u.wrapped_security_domain_secrets.is_empty())
    }

    /// True when the active user has a user-verifying key.
    #[must_use]
    pub fn has_uv_key(&self) -> bool {
        self.active_user()
            .is_some_and(|u| !u.wrapped_uv_private_key.is_empty())
    }

    /// The active user's record, when one exists.
    #[must_use]
    pub fn user(&self) -> Option<&UserRecord> {
        self.active_user()
    }

    /// Takes the retained raw secret of the last processed batch, if any.
    pub fn take_retained_secret(&mut self) -> Option<(SecretVersion, Vec<u8>)> {
        self.retained_secret.take()
    }

    // -- transitions ---------------------------------------------------------

    /// Consumes one event and returns the effects to execute.
    ///
    /// Events that do not match the current state are dropped; the driver's
    /// generation stamping makes that the common case after an identity
    /// change rather than an error.
    pub fn step(&mut self, event: Event, identity: &IdentitySnapshot) -> Vec<Effect> {
        // A primary-account change fails whatever is in flight: the result
        // that just arrived belongs to the old identity and is dropped, and
        // the next-action pass reconciles before anything else runs.
        if self.loaded
            && !matches!(self.state, State::Init | State::Idle | State::Loading)
            && self.active != identity.primary
        {
            tracing::warn!(state = %self.state, "abandoning in-flight operation after identity change");
            self.want_registration = false;
            self.wrapping = None;
            return self.run_next_action(identity);
        }
        let effects = match (self.state, event) {
            (State::Init, _) => Vec::new(),
            (State::Idle, Event::Poke) => self.run_next_action(identity),
            (State::Loading, Event::FileContents(contents)) => {
                self.local = contents.as_deref().map_or_else(LocalState::empty, state::file::decode);
                self.loaded = true;
                self.run_next_action(identity)
            }
            (State::GeneratingKeys, Event::KeysReady { hardware, uv }) => {
                self.on_keys_ready(hardware.as_ref(), uv.as_deref(), identity)
            }
            (State::WaitingForTokenForRegistration, Event::AccessToken(token)) => {
                self.on_registration_token(token, identity)
            }
            (State::RegisteringWithEnclave, Event::EnclaveResponse(response)) => {
                self.on_registration_response(&response, identity)
            }
            (State::WaitingForTokenForWrapping, Event::AccessToken(token)) => {
                self.on_wrapping_token(token, identity)
            }
            (State::WrappingSecrets, Event::EnclaveResponse(response)) => {
                self.on_wrapping_response(&response, identity)
            }
            (State::JoiningDomain, Event::Join(status)) => self.on_join(status, identity),
            (
                State::GeneratingKeys
                | State::WaitingForTokenForRegistration
                | State::RegisteringWithEnclave
                | State::WaitingForTokenForWrapping
                | State::WrappingSecrets,
                Event::Failure,
            ) => self.on_failure(identity),
            (state, event) => {
                tracing::warn!(state = %state, event = event.name(), "dropping mismatched event");
                Vec::new()
            }
        };
        if tracing::enabled!(tracing::Level::DEBUG) {
            let names: Vec<&str> = effects.iter().map(Effect::name).collect();
            tracing::debug!(state = %self.state, effects = ?names, "stepped");
        }
        effects
    }

    /// The decision point re-evaluated whenever the machine would otherwise
    /// go idle.
    fn run_next_action(&mut self, identity: &IdentitySnapshot) -> Vec<Effect> {
        if !self.loaded {
            self.state = State::Loading;
            return vec![Effect::LoadState];
        }
        let mut effects = Vec::new();
        if self.active != identity.primary {
            if let Some(effect) = self.handle_identity_change(identity) {
                effects.push(effect);
            }
        }
        // A batch queued for an account that is no longer primary is dropped.
        if self
            .pending_store_keys
            .as_ref()
            .is_some_and(|args| Some(&args.account_id) != self.active.as_ref())
        {
            tracing::warn!("discarding store-keys batch for non-primary account");
            self.pending_store_keys = None;
        }
        let Some(account) = self.active.clone() else {
            self.want_registration = false;
            effects.extend(self.enter_idle());
            return effects;
        };
        let user = self.local.user_mut_or_default(&account);
        if user.registered {
            self.want_registration = false;
        } else if self.want_registration || self.pending_store_keys.is_some() {
            self.state = State::GeneratingKeys;
            let existing_hardware_key = (!user.wrapped_hardware_private_key.is_empty())
                .then(|| user.wrapped_hardware_private_key.clone());
            let existing_uv_label = (!user.wrapped_uv_private_key.is_empty())
                .then(|| String::from_utf8_lossy(&user.wrapped_uv_private_key).into_owned());
            effects.push(Effect::GenerateKeys {
                existing_hardware_key,
                existing_uv_label,
            });
            return effects;
        }
        if user.registered {
            if let Some(args) = self.pending_store_keys.take() {
                let new_secrets = state::new_secrets_to_store(user, &args);
                if new_secrets.is_empty() {
                    if !user.joined && !user.member_public_key.is_empty() {
                        self.state = State::JoiningDomain;
                        effects.push(Effect::JoinSecurityDomain {
                            account,
                            member_public_key: user.member_public_key.clone(),
                            secrets: args.keys.clone(),
                            last_key_version: args.last_key_version,
                        });
                        self.wrapping = Some(WrappingOp {
                            new_secrets: BTreeMap::new(),
                            args,
                        });
                        return effects;
                    }
                    // Nothing new and already joined; the batch is done.
                    self.finish_batch(&args);
                } else {
                    self.state = State::WaitingForTokenForWrapping;
                    self.wrapping = Some(WrappingOp { new_secrets, args });
                    effects.push(Effect::FetchAccessToken);
                    return effects;
                }
            }
        }
        effects.extend(self.enter_idle());
        effects
    }

    /// Reconciles local state against a changed primary account.
    ///
    /// In-flight scratch is dropped and the generation bumped so outstanding
    /// callbacks die on arrival. Records for accounts that have left the
    /// cookie jar are erased, except the new primary's.
    fn handle_identity_change(&mut self, identity: &IdentitySnapshot) -> Option<Effect> {
        tracing::info!(
            from = ?self.active,
            to = ?identity.primary,
            "primary account changed, reconciling"
        );
        self.generation += 1;
        self.wrapping = None;
        self.retained_secret = None;
        self.active = identity.primary.clone();
        let mut changed = false;
        if let Some(jar) = &identity.cookie_jar {
            let before = self.local.users.len();
            self.local.users.retain(|account, _| {
                jar.contains(account) || Some(account) == self.active.as_ref()
            });
            changed = self.local.users.len() != before;
        }
        changed.then(|| self.persist_effect())
    }

    fn on_keys_ready(
        &mut self,
        hardware: &dyn HardwareSigningKey,
        uv: Option<&dyn UserVerifyingKey>,
        identity: &IdentitySnapshot,
    ) -> Vec<Effect> {
        let Some(account) = self.active.clone() else {
            return self.on_failure(identity);
        };
        let public_key = hardware.public_key_info();
        let wrapped = hardware.wrapped_key();
        let device_id = Sha256::digest(&public_key).to_vec();
        let user = self.local.user_mut_or_default(&account);
        let mut changed = false;
        if user.hardware_public_key != public_key {
            user.hardware_public_key = public_key;
            user.wrapped_hardware_private_key = wrapped;
            user.device_id = device_id;
            changed = true;
        }
        if let Some(uv) = uv {
            let label = uv.label().as_bytes().to_vec();
            if user.wrapped_uv_private_key != label {
                user.uv_public_key = uv.public_key_info();
                user.wrapped_uv_private_key = label;
                changed = true;
            }
        }
        self.state = State::WaitingForTokenForRegistration;
        let mut effects = Vec::new();
        if changed {
            effects.push(self.persist_effect());
        }
        effects.push(Effect::FetchAccessToken);
        effects
    }

    fn on_registration_token(&mut self, token: String, identity: &IdentitySnapshot) -> Vec<Effect> {
        let Some(user) = self.active_user() else {
            // No record to register; abandon rather than wedge here with no
            // outstanding work.
            return self.on_failure(identity);
        };
        let uv_public_key =
            (!user.uv_public_key.is_empty()).then_some(user.uv_public_key.as_slice());
        let request = crate::protocol::build_registration_message(
            &user.device_id,
            &user.hardware_public_key,
            uv_public_key,
        );
        self.state = State::RegisteringWithEnclave;
        vec![Effect::Transact {
            token,
            request,
            signer: None,
        }]
    }

    fn on_registration_response(
        &mut self,
        response: &ciborium::Value,
        identity: &IdentitySnapshot,
    ) -> Vec<Effect> {
        if !crate::protocol::is_all_ok(response, 2) {
            tracing::warn!("enclave rejected registration");
            return self.on_failure(identity);
        }
        let (member_public_key, wrapped_member_private_key) =
            match crate::protocol::member_keys_from_response(response) {
                Ok(keys) => keys,
                Err(err) => {
                    tracing::warn!("malformed registration response: {err}");
                    return self.on_failure(identity);
                }
            };
        let Some(account) = self.active.clone() else {
            return self.on_failure(identity);
        };
        let user = self.local.user_mut_or_default(&account);
        user.registered = true;
        user.member_public_key = member_public_key;
        user.wrapped_member_private_key = wrapped_member_private_key;
        self.want_registration = false;
        tracing::info!(account = %account, "device registered with enclave");
        let mut effects = vec![self.persist_effect()];
        effects.extend(self.run_next_action(identity));
        effects
    }

    fn on_wrapping_token(&mut self, token: String, identity: &IdentitySnapshot) -> Vec<Effect> {
        let Some(op) = &self.wrapping else {
            return self.on_failure(identity);
        };
        let request = crate::protocol::build_wrapping_message(&op.new_secrets);
        let Some(user) = self.active_user() else {
            return self.on_failure(identity);
        };
        let signer = TransactSigner {
            wrapped_key: user.wrapped_hardware_private_key.clone(),
            device_id: user.device_id.clone(),
        };
        self.state = State::WrappingSecrets;
        vec![Effect::Transact {
            token,
            request,
            signer: Some(signer),
        }]
    }

    fn on_wrapping_response(
        &mut self,
        response: &ciborium::Value,
        identity: &IdentitySnapshot,
    ) -> Vec<Effect> {
        let Some(op) = self.wrapping.take() else {
            return self.on_failure(identity);
        };
        let versions: Vec<SecretVersion> = op.new_secrets.keys().copied().collect();
        if !crate::protocol::is_all_ok(response, versions.len()) {
            tracing::warn!("enclave rejected secret wrapping");
            return self.on_failure(identity);
        }
        let wrapped = match crate::protocol::wrapped_secrets_from_response(response, &versions) {
            Ok(wrapped) => wrapped,
            Err(err) => {
                tracing::warn!("malformed wrapping response: {err}");
                return self.on_failure(identity);
            }
        };
        let Some(account) = self.active.clone() else {
            return self.on_failure(identity);
        };
        let user = self.local.user_mut_or_default(&account);
        user.wrapped_security_domain_secrets.extend(wrapped);
        if !user.joined && !user.member_public_key.is_empty() {
            let member_public_key = user.member_public_key.clone();
            self.state = State::JoiningDomain;
            let effects = vec![
                self.persist_effect(),
                Effect::JoinSecurityDomain {
                    account,
                    member_public_key,
                    secrets: op.args.keys.clone(),
                    last_key_version: op.args.last_key_version,
                },
            ];
            self.wrapping = Some(op);
            return effects;
        }
        self.finish_batch(&op.args);
        let mut effects = vec![self.persist_effect()];
        effects.extend(self.run_next_action(identity));
        effects
    }

    fn on_join(&mut self, status: JoinStatus, identity: &IdentitySnapshot) -> Vec<Effect> {
        let Some(op) = self.wrapping.take() else {
            return self.on_failure(identity);
        };
        let Some(account) = self.active.clone() else {
            return self.on_failure(identity);
        };
        let user = self.local.user_mut_or_default(&account);
        if status.is_member() {
            user.joined = true;
            tracing::info!(account = %account, %status, "joined security domain");
            self.finish_batch(&op.args);
        } else {
            // The server rejected the member key, so the wrapped secrets can
            // no longer be trusted; purge them and force re-wrapping on the
            // next attempt.
            tracing::warn!(account = %account, %status, "join failed, purging wrapped secrets");
            user.wrapped_security_domain_secrets.clear();
            self.store_keys_count += 1;
        }
        let mut effects = vec![self.persist_effect()];
        effects.extend(self.run_next_action(identity));
        effects
    }

    /// Abandons the current high-level request: the flags that drove it are
    /// cleared so the next-action pass does not immediately retry, and any
    /// partially persisted progress (for example a generated hardware key)
    /// stays on disk for reuse.
    fn on_failure(&mut self, identity: &IdentitySnapshot) -> Vec<Effect> {
        tracing::warn!(state = %self.state, "operation failed, abandoning current request");
        self.want_registration = false;
        self.pending_store_keys = None;
        self.wrapping = None;
        self.run_next_action(identity)
    }

    /// Records a fully processed batch and retains its newest raw secret.
    fn finish_batch(&mut self, args: &StoreKeysArgs) {
        if let Some(newest) = args.keys.last() {
            self.retained_secret = Some((args.last_key_version, newest.clone()));
        }
        self.store_keys_count += 1;
    }

    fn enter_idle(&mut self) -> Vec<Effect> {
        self.state = State::Idle;
        self.wrapping = None;
        self.generation += 1;
        vec![Effect::NotifyIdle]
    }

    /// Encodes the current state for persistence, resetting it first if an
    /// invariant no longer holds.
    fn persist_effect(&mut self) -> Effect {
        if let Err(clause) = self.local.check_invariants() {
            tracing::error!("state invariant failed before write: {clause}");
            self.local = LocalState::empty();
        }
        match state::file::encode(&self.local) {
            Ok(encoded) => Effect::PersistState(encoded),
            Err(err) => {
                // Serialization of an in-memory tree does not fail in
                // practice; encode an empty state so the write still lands.
                tracing::error!("failed to encode state: {err}");
                self.local = LocalState::empty();
                Effect::PersistState(
                    state::file::encode(&self.local).unwrap_or_default(),
                )
            }
        }
    }
}
