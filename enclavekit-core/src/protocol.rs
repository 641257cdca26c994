//! CBOR command maps exchanged with the enclave.
//!
//! A request is an ordered array of command maps; the response is an array of
//! the same length, each entry a map carrying either an `ok` entry or an
//! `err` entry. Command order matters: the response is matched to the request
//! by position.

use std::collections::BTreeMap;

use ciborium::Value;

use crate::error::{EnclaveError, EnclaveResult};
use crate::types::SecretVersion;

/// Key naming the command inside a command map.
pub const REQUEST_COMMAND_KEY: &str = "cmd";
/// Command registering a new device.
pub const REGISTER_COMMAND_NAME: &str = "device/register";
/// Command asking the enclave to generate and wrap a fresh keypair.
pub const GEN_KEY_PAIR_COMMAND_NAME: &str = "keys/genpair";
/// Command asking the enclave to wrap a caller-provided key.
pub const WRAP_KEY_COMMAND_NAME: &str = "keys/wrap";
/// Register command: the device identifier.
pub const REGISTER_DEVICE_ID_KEY: &str = "device_id";
/// Register command: map of public keys by key name.
pub const REGISTER_PUB_KEYS_KEY: &str = "pub_keys";
/// Name of the hardware-backed key in the register map.
pub const HARDWARE_KEY_NAME: &str = "hw";
/// Name of the user-verifying key in the register map.
pub const USER_VERIFYING_KEY_NAME: &str = "uv";
/// Wrapping commands: the purpose string bound into the wrapped blob.
pub const WRAPPING_PURPOSE_KEY: &str = "purpose";
/// Purpose for the security-domain member keypair.
pub const MEMBER_KEY_PURPOSE: &str = "security domain member key";
/// Purpose for wrapped security-domain secrets.
pub const SECRET_PURPOSE: &str = "security domain secret";
/// Wrap command: the raw key to wrap.
pub const WRAPPING_KEY_TO_WRAP: &str = "key";
/// Response entry present on success.
pub const RESPONSE_SUCCESS_KEY: &str = "ok";
/// Response entry present on failure.
pub const RESPONSE_ERROR_KEY: &str = "err";
/// Genpair response: the public key.
pub const WRAPPING_RESPONSE_PUBLIC_KEY: &str = "pub_key";
/// Genpair response: the wrapped private key.
pub const WRAPPING_RESPONSE_WRAPPED_PRIVATE_KEY: &str = "priv_key";

/// Looks up `key` in a CBOR map with text keys.
#[must_use]
pub fn map_get<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

fn text(s: &str) -> Value {
    Value::Text(s.to_owned())
}

/// Builds the two-command registration request: register the device's public
/// keys, then have the enclave generate the security-domain member keypair.
#[must_use]
pub fn build_registration_message(
    device_id: &[u8],
    hardware_public_key: &[u8],
    uv_public_key: Option<&[u8]>,
) -> Value {
    let mut pub_keys = vec![(
        text(HARDWARE_KEY_NAME),
        Value::Bytes(hardware_public_key.to_vec()),
    )];
    if let Some(uv) = uv_public_key {
        pub_keys.push((text(USER_VERIFYING_KEY_NAME), Value::Bytes(uv.to_vec())));
    }
    let register = Value::Map(vec![
        (text(REQUEST_COMMAND_KEY), text(REGISTER_COMMAND_NAME)),
        (text(REGISTER_DEVICE_ID_KEY), Value::Bytes(device_id.to_vec())),
        (text(REGISTER_PUB_KEYS_KEY), Value::Map(pub_keys)),
    ]);
    let gen_member_key = Value::Map(vec![
        (text(REQUEST_COMMAND_KEY), text(GEN_KEY_PAIR_COMMAND_NAME)),
        (text(WRAPPING_PURPOSE_KEY), text(MEMBER_KEY_PURPOSE)),
    ]);
    Value::Array(vec![register, gen_member_key])
}

/// Builds one wrap command per secret, ordered by ascending version to match
/// the response back up by position.
#[must_use]
pub fn build_wrapping_message(secrets: &BTreeMap<SecretVersion, Vec<u8>>) -> Value {
    let commands = secrets
        .values()
        .map(|secret| {
            Value::Map(vec![
                (text(REQUEST_COMMAND_KEY), text(WRAP_KEY_COMMAND_NAME)),
                (text(WRAPPING_PURPOSE_KEY), text(SECRET_PURPOSE)),
                (text(WRAPPING_KEY_TO_WRAP), Value::Bytes(secret.clone())),
            ])
        })
        .collect();
    Value::Array(commands)
}

/// True iff `response` is an array of exactly `expected` entries, every one a
/// map containing a success entry.
#[must_use]
pub fn is_all_ok(response: &Value, expected: usize) -> bool {
    let Some(entries) = response.as_array() else {
        return false;
    };
    if entries.len() != expected {
        return false;
    }
    entries.iter().all(|entry| {
        entry
            .as_map()
            .is_some_and(|map| map_get(map, RESPONSE_SUCCESS_KEY).is_some())
    })
}

/// Extracts the member keypair from a registration response (position 1, the
/// genpair command's slot).
///
/// # Errors
///
/// Returns a protocol error if the response does not carry both halves.
pub fn member_keys_from_response(response: &Value) -> EnclaveResult<(Vec<u8>, Vec<u8>)> {
    let payload = response
        .as_array()
        .and_then(|entries| entries.get(1))
        .and_then(Value::as_map)
        .and_then(|map| map_get(map, RESPONSE_SUCCESS_KEY))
        .and_then(Value::as_map)
        .ok_or_else(|| EnclaveError::Protocol("genpair response missing".into()))?;
    let public_key = map_get(payload, WRAPPING_RESPONSE_PUBLIC_KEY)
        .and_then(Value::as_bytes)
        .ok_or_else(|| EnclaveError::Protocol("genpair response missing public key".into()))?;
    let wrapped_private_key = map_get(payload, WRAPPING_RESPONSE_WRAPPED_PRIVATE_KEY)
        .and_then(Value::as_bytes)
        .ok_or_else(|| EnclaveError::Protocol("genpair response missing private key".into()))?;
    Ok((public_key.clone(), wrapped_private_key.clone()))
}

/// Matches a wrapping response back to the versions of the request, which
/// were sent in ascending order.
///
/// # Errors
///
/// Returns a protocol error if any entry lacks wrapped bytes.
pub fn wrapped_secrets_from_response(
    response: &Value,
    versions: &[SecretVersion],
) -> EnclaveResult<BTreeMap<SecretVersion, Vec<u8>>> {
    let entries = response
        .as_array()
        .ok_or_else(|| EnclaveError::Protocol("wrapping response is not an array".into()))?;
    if entries.len() != versions.len() {
        return Err(EnclaveError::Protocol(
            "wrapping response length mismatch".into(),
        ));
    }
    let mut wrapped = BTreeMap::new();
    for (version, entry) in versions.iter().zip(entries) {
        let bytes = entry
            .as_map()
            .and_then(|map| map_get(map, RESPONSE_SUCCESS_KEY))
            .and_then(Value::as_bytes)
            .ok_or_else(|| EnclaveError::Protocol("wrap entry missing wrapped bytes".into()))?;
        wrapped.insert(*version, bytes.clone());
    }
    Ok(wrapped)
}
