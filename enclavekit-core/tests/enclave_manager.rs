//! End-to-end registration flows over the in-memory platform providers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use enclavekit_core::controller::{
    EnclaveRequestController, PasskeyEntity, RequestType, UserVerificationMethod,
    UserVerificationRequirement,
};
use enclavekit_core::platform::memory::{
    FakeEnclave, FakeSecurityDomain, InMemoryHardwareKeys, InMemoryUvKeys, MemoryStateCipher,
    StaticTokens, TestIdentity,
};
use enclavekit_core::platform::AccessTokenProvider;
use enclavekit_core::{
    AccountId, EnclaveManager, EnclaveResult, JoinStatus, Providers, StoreKeysArgs, UvUiMode,
};

struct Harness {
    dir: tempfile::TempDir,
    identity: Arc<TestIdentity>,
    hardware: Arc<InMemoryHardwareKeys>,
    tokens: Arc<StaticTokens>,
    enclave: Arc<FakeEnclave>,
    domain: Arc<FakeSecurityDomain>,
    manager: EnclaveManager,
}

impl Harness {
    fn new() -> Self {
        Self::with_options(true, JoinStatus::Success)
    }

    fn with_options(with_uv_keys: bool, join_default: JoinStatus) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(TestIdentity::signed_in(&AccountId::new("gaia1")));
        let hardware = Arc::new(InMemoryHardwareKeys::new());
        let tokens = Arc::new(StaticTokens::new());
        let enclave = Arc::new(FakeEnclave::new());
        let domain = Arc::new(FakeSecurityDomain::new(join_default));
        let manager = EnclaveManager::new(
            dir.path(),
            Providers {
                cipher: Arc::new(MemoryStateCipher::new()),
                hardware_keys: Arc::clone(&hardware) as _,
                uv_keys: with_uv_keys.then(|| Arc::new(InMemoryUvKeys::new()) as _),
                identity: Arc::clone(&identity) as _,
                tokens: Arc::clone(&tokens) as _,
                transport: Arc::clone(&enclave) as _,
                security_domain: Arc::clone(&domain) as _,
            },
            UvUiMode::SystemUi,
        );
        Self {
            dir,
            identity,
            hardware,
            tokens,
            enclave,
            domain,
            manager,
        }
    }

    /// A second manager over the same profile directory, simulating a
    /// restart.
    fn reopened(&self) -> EnclaveManager {
        EnclaveManager::new(
            self.dir.path(),
            Providers {
                cipher: Arc::new(MemoryStateCipher::new()),
                hardware_keys: Arc::clone(&self.hardware) as _,
                uv_keys: None,
                identity: Arc::clone(&self.identity) as _,
                tokens: Arc::clone(&self.tokens) as _,
                transport: Arc::clone(&self.enclave) as _,
                security_domain: Arc::clone(&self.domain) as _,
            },
            UvUiMode::SystemUi,
        )
    }

    fn store_keys(&self, account: &str, keys: Vec<Vec<u8>>, last_key_version: i32) {
        self.manager.store_keys(StoreKeysArgs {
            account_id: AccountId::new(account),
            keys,
            last_key_version,
        });
    }
}

#[tokio::test]
async fn fresh_registration_with_secrets_becomes_ready() {
    let harness = Harness::new();
    let secret = vec![0xA1; 32];
    harness.manager.start();
    harness.store_keys("gaia1", vec![secret.clone()], 417);
    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;

    assert!(harness.manager.is_loaded());
    assert!(harness.manager.is_registered());
    assert!(harness.manager.is_ready());
    assert_eq!(
        harness.manager.get_current_wrapped_secret(),
        Some((417, FakeEnclave::wrap_for_test(&secret)))
    );
    assert_eq!(harness.manager.store_keys_count(), 1);
    assert_eq!(harness.domain.join_count(), 1);
    assert_eq!(harness.enclave.registered_devices(), 1);
    // One registration transaction and one wrapping transaction.
    assert_eq!(harness.enclave.transactions(), 2);
}

#[tokio::test]
async fn repeated_registration_requests_coalesce() {
    let harness = Harness::new();
    harness.manager.start();
    harness.manager.register_if_needed();
    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;
    assert!(harness.manager.is_registered());
    assert_eq!(harness.enclave.transactions(), 1);

    // Registered already; another request must not hit the enclave again.
    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;
    assert_eq!(harness.enclave.transactions(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_registration() {
    let harness = Harness::new();
    harness.manager.start();
    let mut tasks = Vec::new();
    for _ in 0..3 {
        let manager = harness.manager.clone();
        tasks.push(tokio::spawn(async move {
            manager.register_if_needed();
            manager.wait_until_idle().await;
            manager.is_registered()
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap());
    }
    assert_eq!(harness.enclave.transactions(), 1);
    assert_eq!(harness.enclave.registered_devices(), 1);
}

#[tokio::test]
async fn failed_attempt_reuses_the_generated_key() {
    let harness = Harness::new();
    harness.manager.start();
    harness.tokens.fail_next();
    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;
    assert!(!harness.manager.is_registered());
    assert_eq!(harness.hardware.generate_calls(), 1);

    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;
    assert!(harness.manager.is_registered());
    // The persisted wrapped key was reloaded, not regenerated.
    assert_eq!(harness.hardware.generate_calls(), 1);
}

#[tokio::test]
async fn key_generation_failure_leaves_the_machine_unregistered() {
    let harness = Harness::new();
    harness.hardware.fail_next_generate();
    harness.manager.start();
    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;
    assert!(!harness.manager.is_registered());
    assert_eq!(harness.enclave.transactions(), 0);

    // No key was persisted, so the retry generates a fresh one.
    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;
    assert!(harness.manager.is_registered());
    assert_eq!(harness.hardware.generate_calls(), 2);
}

#[tokio::test]
async fn enclave_failure_mid_registration_leaves_no_partial_registration() {
    let harness = Harness::new();
    harness.manager.start();
    harness.enclave.fail_next();
    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;
    assert!(!harness.manager.is_registered());
    assert_eq!(harness.enclave.transactions(), 1);
    assert_eq!(harness.enclave.registered_devices(), 0);

    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;
    assert!(harness.manager.is_registered());
    assert_eq!(harness.enclave.transactions(), 2);
    // The generated key survived the failed transaction and was reloaded.
    assert_eq!(harness.hardware.generate_calls(), 1);
}

#[tokio::test]
async fn enclave_failure_mid_wrapping_abandons_the_batch() {
    let harness = Harness::new();
    harness.manager.start();
    harness.store_keys("gaia1", vec![vec![0x11; 32]], 416);
    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;
    assert!(harness.manager.is_ready());

    harness.enclave.fail_next();
    harness.store_keys("gaia1", vec![vec![0x11; 32], vec![0x22; 32]], 417);
    harness.manager.wait_until_idle().await;
    // The failed batch is dropped without touching the secrets already held.
    assert_eq!(harness.manager.store_keys_count(), 1);
    let secrets = harness.manager.get_wrapped_secrets();
    assert_eq!(secrets.len(), 1);
    assert_eq!(secrets.get(&416), Some(&FakeEnclave::wrap_for_test(&[0x11; 32])));

    harness.store_keys("gaia1", vec![vec![0x11; 32], vec![0x22; 32]], 417);
    harness.manager.wait_until_idle().await;
    assert!(harness.manager.get_wrapped_secrets().contains_key(&417));
    assert_eq!(harness.manager.store_keys_count(), 2);
}

#[tokio::test]
async fn join_rejection_purges_wrapped_secrets() {
    let harness = Harness::with_options(true, JoinStatus::Success);
    harness.domain.push_status(JoinStatus::NetworkError);
    harness.manager.start();
    harness.store_keys("gaia1", vec![vec![0xB2; 32]], 1);
    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;

    assert!(harness.manager.is_registered());
    assert!(!harness.manager.is_ready());
    assert!(harness.manager.get_wrapped_secrets().is_empty());
    assert!(harness.manager.take_secret().is_none());

    // The next batch re-wraps and joins against the recovered service.
    harness.store_keys("gaia1", vec![vec![0xB2; 32]], 1);
    harness.manager.wait_until_idle().await;
    assert!(harness.manager.is_ready());
    assert_eq!(harness.domain.join_count(), 2);
}

/// Token provider that blocks until the test releases it, so identity can be
/// switched while a registration is provably in flight.
struct GatedTokens {
    gate: tokio::sync::Semaphore,
    waiting: AtomicBool,
}

impl GatedTokens {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Semaphore::new(0),
            waiting: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl AccessTokenProvider for GatedTokens {
    async fn fetch_token(&self) -> EnclaveResult<String> {
        self.waiting.store(true, Ordering::SeqCst);
        let _permit = self.gate.acquire().await.unwrap();
        Ok("token".to_owned())
    }
}

#[tokio::test]
async fn account_switch_mid_registration_fails_over_to_new_account() {
    let dir = tempfile::tempdir().unwrap();
    let gaia1 = AccountId::new("gaia1");
    let gaia2 = AccountId::new("gaia2");
    let identity = Arc::new(TestIdentity::signed_in(&gaia1));
    identity.set_cookie_jar(Some(vec![gaia1.clone(), gaia2.clone()]));
    let hardware = Arc::new(InMemoryHardwareKeys::new());
    let tokens = Arc::new(GatedTokens::new());
    let enclave = Arc::new(FakeEnclave::new());
    let manager = EnclaveManager::new(
        dir.path(),
        Providers {
            cipher: Arc::new(MemoryStateCipher::new()),
            hardware_keys: Arc::clone(&hardware) as _,
            uv_keys: None,
            identity: Arc::clone(&identity) as _,
            tokens: Arc::clone(&tokens) as _,
            transport: Arc::clone(&enclave) as _,
            security_domain: Arc::new(FakeSecurityDomain::new(JoinStatus::Success)) as _,
        },
        UvUiMode::SystemUi,
    );
    manager.start();
    manager.register_if_needed();
    while !tokens.waiting.load(Ordering::SeqCst) {
        tokio::task::yield_now().await;
    }
    // Registration is stuck on the token fetch; switch the primary account
    // and then let the fetch complete.
    identity.set_primary(Some(gaia2.clone()));
    manager.identity_updated();
    tokens.gate.add_permits(1);
    manager.wait_until_idle().await;

    // gaia2 is active and unregistered; the in-flight registration died.
    assert!(!manager.is_registered());
    assert_eq!(enclave.transactions(), 0);

    // gaia1's record (the generated key) survived in the cookie jar; a
    // retry after switching back reuses it.
    identity.set_primary(Some(gaia1));
    manager.identity_updated();
    manager.wait_until_idle().await;
    tokens.gate.add_permits(1);
    manager.register_if_needed();
    manager.wait_until_idle().await;
    assert!(manager.is_registered());
    assert_eq!(hardware.generate_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconciliation_erasure_is_never_undone_by_an_older_write() {
    // Race a registration against an identity switch that drops gaia1 from
    // the cookie jar. Whatever the interleaving, the persisted file must end
    // up matching the machine's final view: gaia1 either never finished
    // registering or was erased by reconciliation, so a reopen as gaia1 must
    // never find a registered record resurrected by a stale write.
    for _ in 0..10 {
        let harness = Harness::new();
        harness.manager.start();
        harness.manager.register_if_needed();
        let identity = Arc::clone(&harness.identity);
        let manager = harness.manager.clone();
        let switcher = tokio::spawn(async move {
            tokio::task::yield_now().await;
            identity.set_cookie_jar(Some(vec![AccountId::new("gaia2")]));
            identity.set_primary(Some(AccountId::new("gaia2")));
            manager.identity_updated();
        });
        switcher.await.unwrap();
        harness.manager.wait_until_idle().await;
        harness.manager.wait_for_writes().await;

        harness.identity.set_cookie_jar(Some(vec![AccountId::new("gaia1")]));
        harness.identity.set_primary(Some(AccountId::new("gaia1")));
        let reopened = harness.reopened();
        reopened.start();
        reopened.wait_until_idle().await;
        assert!(!reopened.is_registered());
    }
}

#[tokio::test]
async fn state_survives_a_restart() {
    let harness = Harness::new();
    let secret = vec![0xC3; 32];
    harness.manager.start();
    harness.store_keys("gaia1", vec![secret.clone()], 9);
    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;
    assert!(harness.manager.is_ready());
    harness.manager.wait_for_writes().await;

    let reopened = harness.reopened();
    reopened.start();
    reopened.wait_until_idle().await;
    assert!(reopened.is_registered());
    assert!(reopened.is_ready());
    assert_eq!(
        reopened.get_current_wrapped_secret(),
        Some((9, FakeEnclave::wrap_for_test(&secret)))
    );
    // Nothing was re-registered on the restart path.
    assert_eq!(harness.enclave.transactions(), 2);
}

#[tokio::test]
async fn stale_secret_versions_are_not_rewrapped() {
    let harness = Harness::new();
    harness.manager.start();
    harness.store_keys("gaia1", vec![vec![0xD4; 32]], 416);
    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;
    assert_eq!(harness.enclave.transactions(), 2);

    // A batch carrying the known epoch plus one new one wraps only the new
    // one.
    harness.store_keys("gaia1", vec![vec![0xD4; 32], vec![0xD5; 32]], 417);
    harness.manager.wait_until_idle().await;
    assert_eq!(harness.enclave.transactions(), 3);
    let secrets = harness.manager.get_wrapped_secrets();
    assert_eq!(secrets.len(), 2);
    assert_eq!(secrets.get(&417), Some(&FakeEnclave::wrap_for_test(&[0xD5; 32])));
}

#[tokio::test]
async fn implicit_verification_uses_the_retained_raw_secret() {
    // No UV keys on this platform, so a request right after registration
    // falls back to implicit verification.
    let harness = Harness::with_options(false, JoinStatus::Success);
    let secret = vec![0xE5; 32];
    harness.manager.start();
    harness.store_keys("gaia1", vec![secret.clone()], 417);
    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;
    assert!(harness.manager.is_ready());

    let mut controller = EnclaveRequestController::new(
        harness.manager.clone(),
        RequestType::MakeCredential,
        UserVerificationRequirement::Required,
        false,
        Vec::new(),
    );
    controller.device_added();
    assert_eq!(
        controller.user_verification_method(),
        UserVerificationMethod::Implicit
    );
    let request = controller
        .build_request("token".to_owned(), None, None)
        .unwrap();
    assert_eq!(request.raw_secret, Some(secret));
    assert_eq!(request.key_version, Some(417));
    assert!(request.wrapped_secret.is_none());

    // The raw secret can only be taken once.
    assert!(controller.build_request("token".to_owned(), None, None).is_err());
}

#[tokio::test]
async fn assertion_prefers_the_passkey_epoch_with_fallback() {
    let harness = Harness::with_options(false, JoinStatus::Success);
    harness.manager.start();
    harness.store_keys("gaia1", vec![vec![0xF0; 32], vec![0xF1; 32]], 417);
    harness.manager.register_if_needed();
    harness.manager.wait_until_idle().await;
    assert!(harness.manager.is_ready());

    let creds = vec![
        PasskeyEntity {
            credential_id: vec![1],
            key_version: Some(416),
        },
        PasskeyEntity {
            credential_id: vec![2],
            key_version: None,
        },
    ];
    let controller = EnclaveRequestController::new(
        harness.manager.clone(),
        RequestType::GetAssertion,
        UserVerificationRequirement::Discouraged,
        false,
        creds,
    );
    assert_eq!(
        controller.user_verification_method(),
        UserVerificationMethod::None
    );

    let request = controller
        .build_request("token".to_owned(), None, Some(&[1]))
        .unwrap();
    assert_eq!(
        request.wrapped_secret,
        Some(FakeEnclave::wrap_for_test(&[0xF0; 32]))
    );

    let request = controller
        .build_request("token".to_owned(), None, Some(&[2]))
        .unwrap();
    assert_eq!(
        request.wrapped_secret,
        Some(FakeEnclave::wrap_for_test(&[0xF1; 32]))
    );

    assert!(controller
        .build_request("token".to_owned(), None, Some(&[9]))
        .is_err());
}

#[tokio::test]
async fn store_keys_for_a_signed_out_account_is_dropped() {
    let harness = Harness::new();
    harness.manager.start();
    harness.store_keys("someone-else", vec![vec![1; 16]], 1);
    harness.manager.wait_until_idle().await;
    assert!(!harness.manager.is_registered());
    assert_eq!(harness.enclave.transactions(), 0);
    assert_eq!(harness.manager.store_keys_count(), 0);
}
