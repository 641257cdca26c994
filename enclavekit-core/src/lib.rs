//! Client-side manager for passkey enclave registration.
//!
//! This crate implements the device side of a remote-enclave passkey scheme:
//! it registers the device's hardware-backed keys with the enclave, has the
//! enclave wrap security-domain secrets, joins the account's security domain,
//! and persists the resulting bookkeeping encrypted on disk. The registration
//! flow itself is a pure state machine ([`machine`]); [`manager`] drives it
//! over real I/O, and [`controller`] assembles individual credential requests
//! on top.
//!
//! Everything that touches the OS or the network sits behind the traits in
//! [`platform`]; `platform::memory` provides in-memory implementations for
//! tests.

pub mod controller;
pub mod error;
pub mod machine;
pub mod manager;
pub mod platform;
pub mod protocol;
pub mod state;
pub mod types;

pub use error::{EnclaveError, EnclaveResult};
pub use manager::{EnclaveManager, Providers, UvKeyState, UvUiMode};
pub use types::{AccountId, JoinStatus, SecretVersion, StoreKeysArgs};
