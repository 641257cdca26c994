//! The encrypted persisted blob: `OS_encrypt(bincode(state) || SHA-256)`.
//!
//! Writes are atomic (temp file + rename). Loads absorb every failure mode,
//! whether a missing file, decryption failure, checksum mismatch, parse
//! failure, or invariant violation, into an empty state: losing local
//! registration bookkeeping is recoverable, propagating corruption is not.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::LocalState;
use crate::error::{EnclaveError, EnclaveResult};
use crate::platform::StateCipher;

const SHA256_LENGTH: usize = 32;

/// Serializes `state` and appends the SHA-256 digest of the payload.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(state: &LocalState) -> EnclaveResult<Vec<u8>> {
    let mut payload =
        bincode::serialize(state).map_err(|e| EnclaveError::Serialization(e.to_string()))?;
    let digest = Sha256::digest(&payload);
    payload.extend_from_slice(&digest);
    Ok(payload)
}

/// Parses a decrypted blob back into a [`LocalState`].
///
/// Any mismatch yields an empty state rather than an error; a corrupt state
/// file resets the enclave state for the profile and users re-register.
#[must_use]
pub fn decode(contents: &[u8]) -> LocalState {
    match parse(contents) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!("discarding enclave state: {err}");
            LocalState::empty()
        }
    }
}

fn parse(contents: &[u8]) -> EnclaveResult<LocalState> {
    if contents.len() < SHA256_LENGTH {
        return Err(EnclaveError::Deserialization(
            "state blob too small to carry a checksum".into(),
        ));
    }
    let (payload, digest) = contents.split_at(contents.len() - SHA256_LENGTH);
    let calculated = Sha256::digest(payload);
    if calculated.as_slice() != digest {
        return Err(EnclaveError::Deserialization("checksum mismatch".into()));
    }
    let state: LocalState = bincode::deserialize(payload)
        .map_err(|e| EnclaveError::Deserialization(e.to_string()))?;
    state
        .check_invariants()
        .map_err(EnclaveError::InvariantViolation)?;
    Ok(state)
}

/// Handle to the per-profile state file on disk.
///
/// All methods block; the manager drives them from the blocking pool.
pub struct StateFile {
    path: PathBuf,
    cipher: Arc<dyn StateCipher>,
}

impl StateFile {
    /// Creates a handle for the file at `path`, sealed with `cipher`.
    #[must_use]
    pub fn new(path: PathBuf, cipher: Arc<dyn StateCipher>) -> Self {
        Self { path, cipher }
    }

    /// The on-disk path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and decrypts the raw state blob.
    ///
    /// Returns `None` when the file is absent or cannot be decrypted; the
    /// caller substitutes an empty state.
    #[must_use]
    pub fn read_decrypted(&self) -> Option<Vec<u8>> {
        let sealed = match std::fs::read(&self.path) {
            Ok(sealed) => sealed,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::error!("failed to read enclave state file: {err}");
                return None;
            }
        };
        match self.cipher.open(&sealed) {
            Ok(plaintext) => Some(plaintext),
            Err(err) => {
                tracing::error!("failed to decrypt enclave state file: {err}");
                None
            }
        }
    }

    /// Seals `contents` (the output of [`encode`]) and writes it atomically:
    /// temp file in the same directory, fsync, rename over the target.
    ///
    /// # Errors
    ///
    /// Returns an error if sealing or any filesystem step fails. The previous
    /// file contents survive a failed write.
    pub fn write_sealed(&self, contents: &[u8]) -> EnclaveResult<()> {
        let sealed = self.cipher.seal(contents)?;
        let tmp_path = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EnclaveError::io("creating state directory", e))?;
        }
        let mut tmp = std::fs::File::create(&tmp_path)
            .map_err(|e| EnclaveError::io("creating temp state file", e))?;
        tmp.write_all(&sealed)
            .map_err(|e| EnclaveError::io("writing temp state file", e))?;
        tmp.sync_all()
            .map_err(|e| EnclaveError::io("syncing temp state file", e))?;
        drop(tmp);
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| EnclaveError::io("renaming state file", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::platform::memory::MemoryStateCipher;
    use crate::state::UserRecord;
    use crate::types::AccountId;

    fn sample_state() -> LocalState {
        let mut state = LocalState::empty();
        let user = state.user_mut_or_default(&AccountId::new("gaia1"));
        *user = UserRecord {
            hardware_public_key: vec![1; 32],
            wrapped_hardware_private_key: vec![2; 32],
            device_id: vec![3; 32],
            registered: true,
            wrapped_member_private_key: vec![4; 32],
            member_public_key: vec![5; 65],
            ..UserRecord::default()
        };
        user.wrapped_security_domain_secrets
            .insert(417, vec![6; 48]);
        state
    }

    #[test]
    fn encode_decode_round_trip() {
        let state = sample_state();
        let encoded = encode(&state).unwrap();
        assert_eq!(decode(&encoded), state);
    }

    #[test]
    fn flipping_any_byte_yields_empty_state() {
        let encoded = encode(&sample_state()).unwrap();
        for i in 0..encoded.len() {
            let mut corrupted = encoded.clone();
            corrupted[i] ^= 0x01;
            assert_eq!(decode(&corrupted), LocalState::empty(), "byte {i}");
        }
    }

    #[test]
    fn short_blob_yields_empty_state() {
        assert_eq!(decode(&[0u8; 16]), LocalState::empty());
        assert_eq!(decode(&[]), LocalState::empty());
    }

    #[test]
    fn parse_distinguishes_corruption_from_invariant_violations() {
        assert!(matches!(
            parse(&[0u8; 16]),
            Err(EnclaveError::Deserialization(_))
        ));
        let mut state = LocalState::empty();
        state.user_mut_or_default(&AccountId::new("gaia1")).joined = true;
        let encoded = encode(&state).unwrap();
        assert!(matches!(
            parse(&encoded),
            Err(EnclaveError::InvariantViolation(_))
        ));
    }

    #[test]
    fn invariant_violation_on_load_yields_empty_state() {
        let mut state = LocalState::empty();
        state.user_mut_or_default(&AccountId::new("gaia1")).joined = true;
        // Bypass the write-side check by encoding directly.
        let encoded = encode(&state).unwrap();
        assert_eq!(decode(&encoded), LocalState::empty());
    }

    #[test]
    fn file_round_trip_through_cipher() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(
            dir.path().join("passkey_enclave_state"),
            Arc::new(MemoryStateCipher::new()),
        );
        let state = sample_state();
        file.write_sealed(&encode(&state).unwrap()).unwrap();
        let decrypted = file.read_decrypted().unwrap();
        assert_eq!(decode(&decrypted), state);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(
            dir.path().join("passkey_enclave_state"),
            Arc::new(MemoryStateCipher::new()),
        );
        assert!(file.read_decrypted().is_none());
    }

    #[test]
    fn tampered_sealed_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passkey_enclave_state");
        let file = StateFile::new(path.clone(), Arc::new(MemoryStateCipher::new()));
        file.write_sealed(&encode(&sample_state()).unwrap()).unwrap();
        let mut sealed = std::fs::read(&path).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        std::fs::write(&path, &sealed).unwrap();
        // The memory cipher authenticates its payload, so tampering surfaces
        // as a decryption failure.
        assert!(file.read_decrypted().is_none());
    }
}
