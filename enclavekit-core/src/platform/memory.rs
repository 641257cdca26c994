//! In-memory implementations of the platform traits for testing.
//!
//! None of these are secure. They exist so the state machine and manager can
//! be exercised end-to-end without an OS keystore, a network, or a real
//! enclave.

#![allow(clippy::missing_panics_doc)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use ciborium::Value;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{
    AccessTokenProvider, EnclaveTransport, HardwareKeyProvider, HardwareSigningKey,
    IdentityProvider, SecurityDomainClient, SigningHandle, StateCipher, UserVerifyingKey,
    UserVerifyingKeyProvider,
};
use crate::error::{EnclaveError, EnclaveResult};
use crate::protocol;
use crate::types::{AccountId, JoinStatus, SecretVersion};

// ---------------------------------------------------------------------------
// State cipher

/// In-memory stand-in for the OS encryption facility.
///
/// Keystream-XOR with an appended MAC tag; tampering is detected (a real OS
/// cipher authenticates too) but there is no actual secrecy here.
pub struct MemoryStateCipher {
    key: [u8; 32],
}

impl MemoryStateCipher {
    /// Creates a cipher with a fixed test key.
    #[must_use]
    pub const fn new() -> Self {
        Self { key: [0x5A; 32] }
    }

    fn keystream(&self, nonce: &[u8], len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut counter = 0u64;
        while out.len() < len {
            let mut hasher = Sha256::new();
            hasher.update(self.key);
            hasher.update(nonce);
            hasher.update(counter.to_le_bytes());
            out.extend_from_slice(&hasher.finalize());
            counter += 1;
        }
        out.truncate(len);
        out
    }

    fn tag(&self, nonce: &[u8], ciphertext: &[u8]) -> [u8; 16] {
        let mut hasher = Sha256::new();
        hasher.update(b"tag");
        hasher.update(self.key);
        hasher.update(nonce);
        hasher.update(ciphertext);
        let digest = hasher.finalize();
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&digest[..16]);
        tag
    }
}

impl Default for MemoryStateCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCipher for MemoryStateCipher {
    fn seal(&self, plaintext: &[u8]) -> EnclaveResult<Vec<u8>> {
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        let keystream = self.keystream(&nonce, plaintext.len());
        let ciphertext: Vec<u8> = plaintext
            .iter()
            .zip(keystream.iter())
            .map(|(p, k)| p ^ k)
            .collect();
        let tag = self.tag(&nonce, &ciphertext);
        let mut out = Vec::with_capacity(8 + ciphertext.len() + 16);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> EnclaveResult<Vec<u8>> {
        if sealed.len() < 8 + 16 {
            return Err(EnclaveError::Cipher("sealed blob too short".into()));
        }
        let (nonce, rest) = sealed.split_at(8);
        let (ciphertext, tag) = rest.split_at(rest.len() - 16);
        if self.tag(nonce, ciphertext) != tag {
            return Err(EnclaveError::Cipher("authentication failed".into()));
        }
        let keystream = self.keystream(nonce, ciphertext.len());
        Ok(ciphertext
            .iter()
            .zip(keystream.iter())
            .map(|(c, k)| c ^ k)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Hardware keys

const WRAP_PREFIX: &[u8] = b"hw-wrapped:";

fn fake_spki(seed: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"fake-hw-spki");
    hasher.update(seed);
    let mut spki = vec![0x30, 0x59]; // looks vaguely DER-ish for logs
    spki.extend_from_slice(&hasher.finalize());
    spki
}

struct FakeHardwareKey {
    seed: [u8; 32],
}

impl HardwareSigningKey for FakeHardwareKey {
    fn public_key_info(&self) -> Vec<u8> {
        fake_spki(&self.seed)
    }

    fn wrapped_key(&self) -> Vec<u8> {
        let mut wrapped = WRAP_PREFIX.to_vec();
        wrapped.extend_from_slice(&self.seed);
        wrapped
    }

    fn sign(&self, message: &[u8]) -> EnclaveResult<Vec<u8>> {
        let mut hasher = Sha256::new();
        hasher.update(b"fake-hw-sig");
        hasher.update(self.seed);
        hasher.update(message);
        Ok(hasher.finalize().to_vec())
    }
}

/// In-memory hardware key provider producing deterministic fake keys.
///
/// A key's wrapped form embeds its seed, so `from_wrapped` reproduces the
/// same public key, which the re-registration path depends on.
#[derive(Default)]
pub struct InMemoryHardwareKeys {
    fail_next_generate: AtomicBool,
    generate_calls: AtomicU64,
}

impl InMemoryHardwareKeys {
    /// Creates the provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `generate` call fail.
    pub fn fail_next_generate(&self) {
        self.fail_next_generate.store(true, Ordering::SeqCst);
    }

    /// Number of fresh keys generated (reloads not counted).
    pub fn generate_calls(&self) -> u64 {
        self.generate_calls.load(Ordering::SeqCst)
    }
}

impl HardwareKeyProvider for InMemoryHardwareKeys {
    fn generate(&self) -> EnclaveResult<Box<dyn HardwareSigningKey>> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_generate.swap(false, Ordering::SeqCst) {
            return Err(EnclaveError::Keystore("simulated generation failure".into()));
        }
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Ok(Box::new(FakeHardwareKey { seed }))
    }

    fn from_wrapped(&self, wrapped: &[u8]) -> EnclaveResult<Box<dyn HardwareSigningKey>> {
        let seed_bytes = wrapped
            .strip_prefix(WRAP_PREFIX)
            .ok_or_else(|| EnclaveError::Keystore("unrecognized wrapped key".into()))?;
        let seed: [u8; 32] = seed_bytes
            .try_into()
            .map_err(|_| EnclaveError::Keystore("wrapped key has wrong length".into()))?;
        Ok(Box::new(FakeHardwareKey { seed }))
    }
}

// ---------------------------------------------------------------------------
// User-verifying keys

struct FakeUvKey {
    label: String,
    seed: [u8; 32],
}

impl UserVerifyingKey for FakeUvKey {
    fn label(&self) -> &str {
        &self.label
    }

    fn public_key_info(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"fake-uv-spki");
        hasher.update(self.seed);
        hasher.finalize().to_vec()
    }

    fn sign(&self, message: &[u8]) -> EnclaveResult<Vec<u8>> {
        let mut hasher = Sha256::new();
        hasher.update(b"fake-uv-sig");
        hasher.update(self.seed);
        hasher.update(message);
        Ok(hasher.finalize().to_vec())
    }
}

/// In-memory user-verifying key provider, addressed by label.
#[derive(Default)]
pub struct InMemoryUvKeys {
    keys: Mutex<HashMap<String, [u8; 32]>>,
}

impl InMemoryUvKeys {
    /// Creates the provider with no keys.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes the key under `label`, simulating key loss.
    pub fn remove(&self, label: &str) {
        self.keys.lock().unwrap().remove(label);
    }
}

impl UserVerifyingKeyProvider for InMemoryUvKeys {
    fn generate(&self, label: &str) -> EnclaveResult<Box<dyn UserVerifyingKey>> {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        self.keys.lock().unwrap().insert(label.to_owned(), seed);
        Ok(Box::new(FakeUvKey {
            label: label.to_owned(),
            seed,
        }))
    }

    fn load(&self, label: &str) -> EnclaveResult<Box<dyn UserVerifyingKey>> {
        let keys = self.keys.lock().unwrap();
        let seed = keys
            .get(label)
            .ok_or_else(|| EnclaveError::Keystore(format!("no uv key under label {label}")))?;
        Ok(Box::new(FakeUvKey {
            label: label.to_owned(),
            seed: *seed,
        }))
    }
}

// ---------------------------------------------------------------------------
// Access tokens

/// Token provider handing out `token-N` strings, with scriptable failure.
#[derive(Default)]
pub struct StaticTokens {
    counter: Mutex<u64>,
    fail_next: AtomicBool,
}

impl StaticTokens {
    /// Creates the provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next fetch fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl AccessTokenProvider for StaticTokens {
    async fn fetch_token(&self) -> EnclaveResult<String> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EnclaveError::Token("simulated token failure".into()));
        }
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        Ok(format!("token-{counter}"))
    }
}

// ---------------------------------------------------------------------------
// Fake enclave

#[derive(Default)]
struct FakeEnclaveInner {
    registered_devices: HashMap<Vec<u8>, Vec<u8>>,
    transactions: u64,
    fail_next: bool,
}

/// An in-process enclave implementing the register / genpair / wrap commands
/// over the real CBOR command maps.
///
/// Counts transactions so tests can assert coalescing, and verifies that
/// wrap requests arrive with a working signer.
#[derive(Default)]
pub struct FakeEnclave {
    inner: Mutex<FakeEnclaveInner>,
}

impl FakeEnclave {
    /// Creates the enclave with no registered devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions performed so far.
    pub fn transactions(&self) -> u64 {
        self.inner.lock().unwrap().transactions
    }

    /// Number of devices the enclave has seen register.
    pub fn registered_devices(&self) -> usize {
        self.inner.lock().unwrap().registered_devices.len()
    }

    /// Makes the next transaction fail at the transport level.
    pub fn fail_next(&self) {
        self.inner.lock().unwrap().fail_next = true;
    }

    /// The wrapped form this enclave produces for `secret`.
    #[must_use]
    pub fn wrap_for_test(secret: &[u8]) -> Vec<u8> {
        let mut wrapped = b"enclave-wrapped:".to_vec();
        wrapped.extend_from_slice(secret);
        wrapped
    }

    fn handle_command(inner: &mut FakeEnclaveInner, command: &Value) -> EnclaveResult<Value> {
        let map = command
            .as_map()
            .ok_or_else(|| EnclaveError::Protocol("command is not a map".into()))?;
        let cmd = protocol::map_get(map, protocol::REQUEST_COMMAND_KEY)
            .and_then(Value::as_text)
            .ok_or_else(|| EnclaveError::Protocol("missing command name".into()))?;
        match cmd {
            protocol::REGISTER_COMMAND_NAME => {
                let device_id = protocol::map_get(map, protocol::REGISTER_DEVICE_ID_KEY)
                    .and_then(Value::as_bytes)
                    .ok_or_else(|| EnclaveError::Protocol("missing device id".into()))?;
                let pub_keys = protocol::map_get(map, protocol::REGISTER_PUB_KEYS_KEY)
                    .and_then(Value::as_map)
                    .ok_or_else(|| EnclaveError::Protocol("missing public keys".into()))?;
                let hw_key = protocol::map_get(pub_keys, protocol::HARDWARE_KEY_NAME)
                    .and_then(Value::as_bytes)
                    .ok_or_else(|| EnclaveError::Protocol("missing hardware key".into()))?;
                inner
                    .registered_devices
                    .insert(device_id.clone(), hw_key.clone());
                Ok(success_map(Value::Null))
            }
            protocol::GEN_KEY_PAIR_COMMAND_NAME => {
                let mut seed = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut seed);
                let mut public_key = vec![0x04];
                public_key.extend_from_slice(&Sha256::digest(seed));
                let wrapped_private = Self::wrap_for_test(&seed);
                Ok(success_map(Value::Map(vec![
                    (
                        Value::Text(protocol::WRAPPING_RESPONSE_PUBLIC_KEY.into()),
                        Value::Bytes(public_key),
                    ),
                    (
                        Value::Text(protocol::WRAPPING_RESPONSE_WRAPPED_PRIVATE_KEY.into()),
                        Value::Bytes(wrapped_private),
                    ),
                ])))
            }
            protocol::WRAP_KEY_COMMAND_NAME => {
                let to_wrap = protocol::map_get(map, protocol::WRAPPING_KEY_TO_WRAP)
                    .and_then(Value::as_bytes)
                    .ok_or_else(|| EnclaveError::Protocol("missing key to wrap".into()))?;
                Ok(success_map(Value::Bytes(Self::wrap_for_test(to_wrap))))
            }
            other => Err(EnclaveError::Protocol(format!("unknown command {other}"))),
        }
    }
}

fn success_map(payload: Value) -> Value {
    Value::Map(vec![(
        Value::Text(protocol::RESPONSE_SUCCESS_KEY.into()),
        payload,
    )])
}

#[async_trait::async_trait]
impl EnclaveTransport for FakeEnclave {
    async fn transact(
        &self,
        _access_token: String,
        request: Value,
        signer: Option<SigningHandle>,
    ) -> EnclaveResult<Value> {
        if let Some(signer) = signer {
            // Wrap requests must prove device identity.
            let mut encoded = Vec::new();
            ciborium::into_writer(&request, &mut encoded)
                .map_err(|e| EnclaveError::Protocol(e.to_string()))?;
            signer
                .sign(encoded)
                .await
                .ok_or_else(|| EnclaveError::Transport("request signature failed".into()))?;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.transactions += 1;
        if inner.fail_next {
            inner.fail_next = false;
            return Err(EnclaveError::Transport("simulated enclave failure".into()));
        }
        let commands = request
            .as_array()
            .ok_or_else(|| EnclaveError::Protocol("request is not an array".into()))?;
        let mut responses = Vec::with_capacity(commands.len());
        for command in commands {
            match Self::handle_command(&mut inner, command) {
                Ok(response) => responses.push(response),
                Err(err) => responses.push(Value::Map(vec![(
                    Value::Text(protocol::RESPONSE_ERROR_KEY.into()),
                    Value::Text(err.to_string()),
                )])),
            }
        }
        Ok(Value::Array(responses))
    }
}

// ---------------------------------------------------------------------------
// Security domain

/// Scripted security-domain service: statuses are popped from a queue, then
/// a default applies.
pub struct FakeSecurityDomain {
    queue: Mutex<VecDeque<JoinStatus>>,
    default: JoinStatus,
    joins: Mutex<Vec<(AccountId, Vec<u8>, usize, SecretVersion)>>,
}

impl FakeSecurityDomain {
    /// Creates the service answering `default` once the queue is drained.
    #[must_use]
    pub fn new(default: JoinStatus) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            default,
            joins: Mutex::new(Vec::new()),
        }
    }

    /// Queues a status for the next join call.
    pub fn push_status(&self, status: JoinStatus) {
        self.queue.lock().unwrap().push_back(status);
    }

    /// Number of join calls observed.
    pub fn join_count(&self) -> usize {
        self.joins.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl SecurityDomainClient for FakeSecurityDomain {
    async fn register_member(
        &self,
        account: &AccountId,
        member_public_key: &[u8],
        secrets: &[Vec<u8>],
        last_key_version: SecretVersion,
    ) -> JoinStatus {
        self.joins.lock().unwrap().push((
            account.clone(),
            member_public_key.to_vec(),
            secrets.len(),
            last_key_version,
        ));
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default)
    }
}

// ---------------------------------------------------------------------------
// Identity

#[derive(Default)]
struct TestIdentityInner {
    primary: Option<AccountId>,
    cookie_jar: Option<Vec<AccountId>>,
}

/// Mutable identity source for tests.
#[derive(Default)]
pub struct TestIdentity {
    inner: Mutex<TestIdentityInner>,
}

impl TestIdentity {
    /// Creates an identity source with no primary account and a stale jar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an identity source whose primary account is also the only
    /// cookie-jar entry.
    #[must_use]
    pub fn signed_in(account: &AccountId) -> Self {
        let identity = Self::new();
        identity.set_primary(Some(account.clone()));
        identity.set_cookie_jar(Some(vec![account.clone()]));
        identity
    }

    /// Sets the primary account.
    pub fn set_primary(&self, primary: Option<AccountId>) {
        self.inner.lock().unwrap().primary = primary;
    }

    /// Sets the cookie-jar account list (`None` = not fresh).
    pub fn set_cookie_jar(&self, cookie_jar: Option<Vec<AccountId>>) {
        self.inner.lock().unwrap().cookie_jar = cookie_jar;
    }
}

impl IdentityProvider for TestIdentity {
    fn primary_account(&self) -> Option<AccountId> {
        self.inner.lock().unwrap().primary.clone()
    }

    fn accounts_in_cookie_jar(&self) -> Option<Vec<AccountId>> {
        self.inner.lock().unwrap().cookie_jar.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_round_trip_and_tamper_detection() {
        let cipher = MemoryStateCipher::new();
        let sealed = cipher.seal(b"hello enclave").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), b"hello enclave");
        let mut tampered = sealed;
        tampered[10] ^= 0x01;
        assert!(cipher.open(&tampered).is_err());
    }

    #[test]
    fn hardware_key_survives_wrap_round_trip() {
        let provider = InMemoryHardwareKeys::new();
        let key = provider.generate().unwrap();
        let reloaded = provider.from_wrapped(&key.wrapped_key()).unwrap();
        assert_eq!(key.public_key_info(), reloaded.public_key_info());
        assert_eq!(key.sign(b"msg").unwrap(), reloaded.sign(b"msg").unwrap());
    }

    #[test]
    fn uv_key_is_lost_after_removal() {
        let provider = InMemoryUvKeys::new();
        provider.generate("label-1").unwrap();
        assert!(provider.load("label-1").is_ok());
        provider.remove("label-1");
        assert!(provider.load("label-1").is_err());
    }

    #[tokio::test]
    async fn fake_enclave_answers_unknown_commands_with_errors() {
        let enclave = FakeEnclave::new();
        let request = Value::Array(vec![Value::Map(vec![(
            Value::Text(protocol::REQUEST_COMMAND_KEY.into()),
            Value::Text("bogus/command".into()),
        )])]);
        let response = enclave.transact("t".into(), request, None).await.unwrap();
        assert!(!protocol::is_all_ok(&response, 1));
    }
}
