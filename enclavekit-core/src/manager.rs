//! The driver that owns a [`Machine`] and executes its effects.
//!
//! [`EnclaveManager`] is a cheap clone handle around shared inner state. The
//! machine itself lives under a mutex and only ever transitions inside
//! [`EnclaveManager::dispatch`]; all blocking and network work runs on spawned
//! tasks that feed their results back in as events. Results are stamped with
//! the machine generation they were spawned under and dropped when it no
//! longer matches, which is how work outstanding across an identity change
//! dies quietly instead of corrupting the new account's record.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::machine::{Effect, Event, IdentitySnapshot, Machine};
use crate::platform::{
    AccessTokenProvider, EnclaveTransport, HardwareKeyProvider, IdentityProvider,
    SecurityDomainClient, SigningHandle, StateCipher, UserVerifyingKey, UserVerifyingKeyProvider,
};
use crate::state::file::StateFile;
use crate::types::{SecretVersion, StoreKeysArgs};

/// File name of the persisted state blob within the profile directory.
pub const STATE_FILE_NAME: &str = "passkey_enclave_state";

/// The capability providers an [`EnclaveManager`] is constructed over.
pub struct Providers {
    /// OS encryption for the state file.
    pub cipher: Arc<dyn StateCipher>,
    /// Hardware-backed signing keys.
    pub hardware_keys: Arc<dyn HardwareKeyProvider>,
    /// User-verifying signing keys, when the platform has them.
    pub uv_keys: Option<Arc<dyn UserVerifyingKeyProvider>>,
    /// The browser's account state.
    pub identity: Arc<dyn IdentityProvider>,
    /// Access tokens for the enclave service.
    pub tokens: Arc<dyn AccessTokenProvider>,
    /// The enclave transaction channel.
    pub transport: Arc<dyn EnclaveTransport>,
    /// The security-domain service.
    pub security_domain: Arc<dyn SecurityDomainClient>,
}

/// How user-verification prompts render on this platform when a UV key
/// exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UvUiMode {
    /// The OS shows its own verification UI when the UV key signs.
    SystemUi,
    /// The browser must show its own verification UI before signing.
    ChromeUi,
}

/// Whether the active user has a user-verifying key, and which UI surfaces
/// its prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UvKeyState {
    /// No user-verifying key is available.
    None,
    /// A UV key exists and the OS prompts for verification.
    UsesSystemUi,
    /// A UV key exists and the browser prompts for verification.
    UsesChromeUi,
}

struct WriteQueue {
    writing: bool,
    pending: Option<Vec<u8>>,
}

struct Inner {
    machine: Mutex<Machine>,
    providers: Providers,
    state_file: Arc<StateFile>,
    uv_ui: UvUiMode,
    idle: watch::Sender<u64>,
    write_queue: Mutex<WriteQueue>,
    writes_done: watch::Sender<u64>,
}

/// Client-side manager of this device's enclave registration.
///
/// Handles clone cheaply; all clones share one state machine. Methods that
/// spawn work must be called within a tokio runtime.
#[derive(Clone)]
pub struct EnclaveManager {
    inner: Arc<Inner>,
}

impl EnclaveManager {
    /// Creates a manager persisting its state under `profile_dir`.
    ///
    /// Nothing is processed until [`start`](Self::start) is called.
    #[must_use]
    pub fn new(profile_dir: &Path, providers: Providers, uv_ui: UvUiMode) -> Self {
        let state_file = Arc::new(StateFile::new(
            profile_dir.join(STATE_FILE_NAME),
            Arc::clone(&providers.cipher),
        ));
        Self {
            inner: Arc::new(Inner {
                machine: Mutex::new(Machine::new()),
                providers,
                state_file,
                uv_ui,
                idle: watch::Sender::new(0),
                write_queue: Mutex::new(WriteQueue {
                    writing: false,
                    pending: None,
                }),
                writes_done: watch::Sender::new(0),
            }),
        }
    }

    // -- requests ------------------------------------------------------------

    /// Begins processing. Calling again is a no-op.
    pub fn start(&self) {
        self.inner.machine.lock().unwrap().start();
        self.poke();
    }

    /// Requests device registration. Queued until the machine is idle;
    /// concurrent requests coalesce into one registration.
    pub fn register_if_needed(&self) {
        self.inner.machine.lock().unwrap().request_registration();
        self.poke();
    }

    /// Hands the manager one batch of raw security-domain secrets to wrap.
    /// An unconsumed earlier batch is replaced.
    pub fn store_keys(&self, args: StoreKeysArgs) {
        self.inner.machine.lock().unwrap().queue_store_keys(args);
        self.poke();
    }

    /// Signals that the primary account or cookie jar may have changed. The
    /// machine reconciles on its next pass.
    pub fn identity_updated(&self) {
        self.poke();
    }

    // -- accessors -----------------------------------------------------------

    /// True when no operation is in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inner.machine.lock().unwrap().is_idle()
    }

    /// True once the persisted state has been loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.inner.machine.lock().unwrap().is_loaded()
    }

    /// True when the active user has registered with the enclave.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.inner.machine.lock().unwrap().is_registered()
    }

    /// True when registered and at least one wrapped secret is held.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.machine.lock().unwrap().is_ready()
    }

    /// Number of store-keys batches fully processed.
    #[must_use]
    pub fn store_keys_count(&self) -> u64 {
        self.inner.machine.lock().unwrap().store_keys_count()
    }

    /// The active user's user-verification key state.
    #[must_use]
    pub fn uv_key_state(&self) -> UvKeyState {
        if !self.inner.machine.lock().unwrap().has_uv_key() {
            return UvKeyState::None;
        }
        match self.inner.uv_ui {
            UvUiMode::SystemUi => UvKeyState::UsesSystemUi,
            UvUiMode::ChromeUi => UvKeyState::UsesChromeUi,
        }
    }

    /// The wrapped secret for `version`, when held. Requires
    /// [`is_ready`](Self::is_ready).
    #[must_use]
    pub fn get_wrapped_secret(&self, version: SecretVersion) -> Option<Vec<u8>> {
        let machine = self.inner.machine.lock().unwrap();
        machine
            .user()?
            .wrapped_security_domain_secrets
            .get(&version)
            .cloned()
    }

    /// All wrapped secrets held for the active user.
    #[must_use]
    pub fn get_wrapped_secrets(&self) -> std::collections::BTreeMap<SecretVersion, Vec<u8>> {
        let machine = self.inner.machine.lock().unwrap();
        machine
            .user()
            .map(|u| u.wrapped_security_domain_secrets.clone())
            .unwrap_or_default()
    }

    /// The wrapped secret with the numerically highest version.
    #[must_use]
    pub fn get_current_wrapped_secret(&self) -> Option<(SecretVersion, Vec<u8>)> {
        let machine = self.inner.machine.lock().unwrap();
        let user = machine.user()?;
        let version = user.current_secret_version()?;
        let bytes = user.wrapped_security_domain_secrets.get(&version)?.clone();
        Some((version, bytes))
    }

    /// Takes the raw newest secret of the last processed batch, if still
    /// held. Used for implicit user verification immediately after
    /// registration; each retained secret can be taken once.
    #[must_use]
    pub fn take_secret(&self) -> Option<(SecretVersion, Vec<u8>)> {
        self.inner.machine.lock().unwrap().take_retained_secret()
    }

    /// A one-shot signer over enclave requests using the hardware key.
    /// `None` unless [`is_registered`](Self::is_registered).
    #[must_use]
    pub fn hardware_key_signing_callback(&self) -> Option<SigningHandle> {
        let machine = self.inner.machine.lock().unwrap();
        let user = machine.user().filter(|u| u.registered)?;
        Some(SigningHandle::hardware(
            user.wrapped_hardware_private_key.clone(),
            user.device_id.clone(),
            Arc::clone(&self.inner.providers.hardware_keys),
        ))
    }

    /// A one-shot signer using the user-verifying key. `None` unless
    /// registered with a UV key on a platform that provides them.
    #[must_use]
    pub fn user_verifying_key_signing_callback(&self) -> Option<SigningHandle> {
        let provider = self.inner.providers.uv_keys.as_ref()?;
        let machine = self.inner.machine.lock().unwrap();
        let user = machine.user().filter(|u| u.registered)?;
        if user.wrapped_uv_private_key.is_empty() {
            return None;
        }
        let label = String::from_utf8_lossy(&user.wrapped_uv_private_key).into_owned();
        Some(SigningHandle::user_verifying(
            label,
            user.device_id.clone(),
            Arc::clone(provider),
        ))
    }

    // -- synchronization (primarily for tests and shutdown) ------------------

    /// Waits until the machine is idle.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.inner.idle.subscribe();
        loop {
            if self.inner.machine.lock().unwrap().is_idle() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Waits until no state-file write is outstanding.
    pub async fn wait_for_writes(&self) {
        let mut rx = self.inner.writes_done.subscribe();
        loop {
            if !self.inner.write_queue.lock().unwrap().writing {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // -- event pump ----------------------------------------------------------

    fn identity_snapshot(&self) -> IdentitySnapshot {
        IdentitySnapshot {
            primary: self.inner.providers.identity.primary_account(),
            cookie_jar: self.inner.providers.identity.accounts_in_cookie_jar(),
        }
    }

    /// Steps the machine with a poke; a no-op unless it is idle.
    fn poke(&self) {
        let snapshot = self.identity_snapshot();
        let (effects, generation) = {
            let mut machine = self.inner.machine.lock().unwrap();
            let effects = self.queue_writes(machine.step(Event::Poke, &snapshot));
            (effects, machine.generation())
        };
        self.run_effects(effects, generation);
    }

    /// Feeds a completed piece of work back into the machine, unless the
    /// generation it was spawned under has passed.
    fn dispatch(&self, generation: u64, event: Event) {
        let snapshot = self.identity_snapshot();
        let (effects, next_generation) = {
            let mut machine = self.inner.machine.lock().unwrap();
            if machine.generation() != generation {
                tracing::debug!("dropping result from a previous generation");
                return;
            }
            let effects = self.queue_writes(machine.step(event, &snapshot));
            (effects, machine.generation())
        };
        self.run_effects(effects, next_generation);
    }

    /// Splits the persistence effects out of `effects` and enqueues them.
    /// Called while the machine lock is still held: steps on racing tasks
    /// would otherwise reach the write queue out of order and an older
    /// snapshot could overwrite a newer one.
    fn queue_writes(&self, effects: Vec<Effect>) -> Vec<Effect> {
        effects
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::PersistState(encoded) => {
                    self.schedule_write(encoded);
                    None
                }
                other => Some(other),
            })
            .collect()
    }

    fn run_effects(&self, effects: Vec<Effect>, generation: u64) {
        for effect in effects {
            match effect {
                Effect::LoadState => self.spawn_load(generation),
                Effect::GenerateKeys {
                    existing_hardware_key,
                    existing_uv_label,
                } => self.spawn_generate_keys(generation, existing_hardware_key, existing_uv_label),
                Effect::FetchAccessToken => self.spawn_fetch_token(generation),
                Effect::Transact {
                    token,
                    request,
                    signer,
                } => self.spawn_transact(generation, token, request, signer),
                Effect::JoinSecurityDomain {
                    account,
                    member_public_key,
                    secrets,
                    last_key_version,
                } => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let status = this
                            .inner
                            .providers
                            .security_domain
                            .register_member(
                                &account,
                                &member_public_key,
                                &secrets,
                                last_key_version,
                            )
                            .await;
                        this.dispatch(generation, Event::Join(status));
                    });
                }
                Effect::PersistState(encoded) => self.schedule_write(encoded),
                Effect::NotifyIdle => {
                    self.inner.idle.send_modify(|n| *n += 1);
                }
            }
        }
    }

    fn spawn_load(&self, generation: u64) {
        let this = self.clone();
        let file = Arc::clone(&self.inner.state_file);
        tokio::spawn(async move {
            let contents = tokio::task::spawn_blocking(move || file.read_decrypted())
                .await
                .unwrap_or_default();
            this.dispatch(generation, Event::FileContents(contents));
        });
    }

    fn spawn_generate_keys(
        &self,
        generation: u64,
        existing_hardware_key: Option<Vec<u8>>,
        existing_uv_label: Option<String>,
    ) {
        let this = self.clone();
        let hardware_keys = Arc::clone(&self.inner.providers.hardware_keys);
        let uv_keys = self.inner.providers.uv_keys.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                let hardware = match existing_hardware_key
                    .as_deref()
                    .map(|wrapped| hardware_keys.from_wrapped(wrapped))
                {
                    Some(Ok(key)) => key,
                    Some(Err(err)) => {
                        tracing::warn!("persisted hardware key unusable, regenerating: {err}");
                        hardware_keys.generate()?
                    }
                    None => hardware_keys.generate()?,
                };
                let uv = uv_keys.and_then(|provider| {
                    match existing_uv_label
                        .as_deref()
                        .map(|label| provider.load(label))
                    {
                        Some(Ok(key)) => Some(key),
                        Some(Err(err)) => {
                            tracing::warn!("persisted uv key unusable, regenerating: {err}");
                            generate_uv_key(provider.as_ref())
                        }
                        None => generate_uv_key(provider.as_ref()),
                    }
                });
                Ok::<_, crate::error::EnclaveError>((hardware, uv))
            })
            .await;
            match result {
                Ok(Ok((hardware, uv))) => {
                    this.dispatch(generation, Event::KeysReady { hardware, uv });
                }
                Ok(Err(err)) => {
                    tracing::warn!("key generation failed: {err}");
                    this.dispatch(generation, Event::Failure);
                }
                Err(err) => {
                    tracing::error!("key generation task panicked: {err}");
                    this.dispatch(generation, Event::Failure);
                }
            }
        });
    }

    fn spawn_fetch_token(&self, generation: u64) {
        let this = self.clone();
        let tokens = Arc::clone(&self.inner.providers.tokens);
        tokio::spawn(async move {
            match tokens.fetch_token().await {
                Ok(token) => this.dispatch(generation, Event::AccessToken(token)),
                Err(err) => {
                    tracing::warn!("access token fetch failed: {err}");
                    this.dispatch(generation, Event::Failure);
                }
            }
        });
    }

    fn spawn_transact(
        &self,
        generation: u64,
        token: String,
        request: ciborium::Value,
        signer: Option<crate::machine::TransactSigner>,
    ) {
        let this = self.clone();
        let transport = Arc::clone(&self.inner.providers.transport);
        let handle = signer.map(|s| {
            SigningHandle::hardware(
                s.wrapped_key,
                s.device_id,
                Arc::clone(&self.inner.providers.hardware_keys),
            )
        });
        tokio::spawn(async move {
            match transport.transact(token, request, handle).await {
                Ok(response) => this.dispatch(generation, Event::EnclaveResponse(response)),
                Err(err) => {
                    tracing::warn!("enclave transaction failed: {err}");
                    this.dispatch(generation, Event::Failure);
                }
            }
        });
    }

    /// Schedules an encoded state blob for writing. Callers hold the machine
    /// lock, so blobs arrive here in step order. A write already in progress
    /// absorbs the new blob as its follow-up: at most one redundant rewrite,
    /// never an unbounded queue.
    fn schedule_write(&self, encoded: Vec<u8>) {
        {
            let mut queue = self.inner.write_queue.lock().unwrap();
            if queue.writing {
                queue.pending = Some(encoded);
                return;
            }
            queue.writing = true;
        }
        self.spawn_write(encoded);
    }

    fn spawn_write(&self, encoded: Vec<u8>) {
        let this = self.clone();
        let file = Arc::clone(&self.inner.state_file);
        tokio::spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || file.write_sealed(&encoded)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!("failed to write state file: {err}"),
                Err(err) => tracing::error!("state write task panicked: {err}"),
            }
            let next = {
                let mut queue = this.inner.write_queue.lock().unwrap();
                let next = queue.pending.take();
                if next.is_none() {
                    queue.writing = false;
                }
                next
            };
            match next {
                Some(encoded) => this.spawn_write(encoded),
                None => this.inner.writes_done.send_modify(|n| *n += 1),
            }
        });
    }
}

fn generate_uv_key(
    provider: &dyn UserVerifyingKeyProvider,
) -> Option<Box<dyn UserVerifyingKey>> {
    use base64::Engine;
    use rand::RngCore;
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let label = format!(
        "enclave-uvkey-{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(nonce)
    );
    match provider.generate(&label) {
        Ok(key) => Some(key),
        Err(err) => {
            // A user-verifying key is an optional extra; registration
            // proceeds without one.
            tracing::warn!("uv key generation failed: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::{
        FakeEnclave, FakeSecurityDomain, InMemoryHardwareKeys, InMemoryUvKeys, MemoryStateCipher,
        StaticTokens, TestIdentity,
    };
    use crate::types::{AccountId, JoinStatus};

    fn providers(identity: Arc<TestIdentity>) -> Providers {
        Providers {
            cipher: Arc::new(MemoryStateCipher::new()),
            hardware_keys: Arc::new(InMemoryHardwareKeys::new()),
            uv_keys: Some(Arc::new(InMemoryUvKeys::new())),
            identity,
            tokens: Arc::new(StaticTokens::new()),
            transport: Arc::new(FakeEnclave::new()),
            security_domain: Arc::new(FakeSecurityDomain::new(JoinStatus::Success)),
        }
    }

    #[tokio::test]
    async fn uv_key_state_reflects_ui_mode() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(TestIdentity::signed_in(&AccountId::new("gaia1")));
        let manager =
            EnclaveManager::new(dir.path(), providers(identity), UvUiMode::ChromeUi);
        assert_eq!(manager.uv_key_state(), UvKeyState::None);
        manager.start();
        manager.register_if_needed();
        manager.wait_until_idle().await;
        assert!(manager.is_registered());
        assert_eq!(manager.uv_key_state(), UvKeyState::UsesChromeUi);
    }

    #[tokio::test]
    async fn accessors_before_start_report_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(TestIdentity::signed_in(&AccountId::new("gaia1")));
        let manager = EnclaveManager::new(dir.path(), providers(identity), UvUiMode::SystemUi);
        assert!(!manager.is_loaded());
        assert!(!manager.is_registered());
        assert!(!manager.is_ready());
        assert!(manager.get_current_wrapped_secret().is_none());
        assert!(manager.hardware_key_signing_callback().is_none());
    }
}
