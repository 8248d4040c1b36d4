//! Server side of SCRAM-SHA-256 (RFC 5802, RFC 7677).
//!
//! The client proof is fully verified: the proof is XOR-ed with the
//! client signature and the recovered client key is hashed and compared
//! against the stored key. The server signature is returned for the
//! final server message so the client can authenticate us in turn.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::realm::ScramCredentials;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    #[error("malformed SCRAM message: {0}")]
    Malformed(&'static str),

    /// `y` or `p=` GS2 prefixes; only the no-binding indicator `n` is
    /// accepted.
    #[error("channel binding not supported")]
    ChannelBinding,

    #[error("nonce mismatch")]
    NonceMismatch,

    #[error("client proof verification failed")]
    BadProof,
}

/// Parsed `client-first-message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFirst {
    pub username: String,
    pub client_nonce: String,
    /// The message without its GS2 header; first half of the AuthMessage.
    pub bare: String,
}

/// State carried between the two SCRAM exchanges.
#[derive(Clone)]
pub struct ScramScratch {
    pub username: String,
    pub client_first_bare: String,
    pub server_first: String,
    pub full_nonce: String,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

impl ScramScratch {
    /// Overwrite key material before release.
    pub fn wipe(&mut self) {
        for byte in self.stored_key.iter_mut() {
            *byte = 0;
        }
        for byte in self.server_key.iter_mut() {
            *byte = 0;
        }
    }
}

/// Parse `gs2-header client-first-bare`, e.g. `n,,n=alice,r=rOprNGfwEbeRWgbNEkqO`.
pub fn parse_client_first(message: &str) -> Result<ClientFirst, ScramError> {
    let bare = match message.strip_prefix("n,") {
        Some(rest) => rest,
        None if message.starts_with("y,") || message.starts_with("p=") => {
            return Err(ScramError::ChannelBinding)
        }
        None => return Err(ScramError::Malformed("bad GS2 header")),
    };

    // Optional authzid between the two GS2 commas.
    let bare = match bare.split_once(',') {
        Some((_authzid, rest)) => rest,
        None => return Err(ScramError::Malformed("bad GS2 header")),
    };

    let mut username = None;
    let mut nonce = None;

    for attr in bare.split(',') {
        match attr.split_at_checked(2) {
            Some(("n=", value)) => username = Some(unescape_saslname(value)?),
            Some(("r=", value)) => nonce = Some(value.to_owned()),
            Some(("m=", _)) => return Err(ScramError::Malformed("mandatory extension")),
            _ => {}
        }
    }

    Ok(ClientFirst {
        username: username.ok_or(ScramError::Malformed("missing n="))?,
        client_nonce: nonce.ok_or(ScramError::Malformed("missing r="))?,
        bare: bare.to_owned(),
    })
}

/// Build the `server-first-message`.
pub fn server_first(full_nonce: &str, salt: &[u8], iterations: u32) -> String {
    format!(
        "r={},s={},i={}",
        full_nonce,
        BASE64.encode(salt),
        iterations
    )
}

/// Verify the `client-final-message`; on success returns the
/// `server-final-message` (`v=...`).
pub fn verify_client_final(
    scratch: &ScramScratch,
    credentials: &ScramCredentials,
    client_final: &str,
) -> Result<String, ScramError> {
    let mut channel_binding = None;
    let mut nonce = None;
    let mut proof = None;
    let mut without_proof_len = client_final.len();

    for attr in client_final.split(',') {
        match attr.split_at_checked(2) {
            Some(("c=", value)) => channel_binding = Some(value),
            Some(("r=", value)) => nonce = Some(value),
            Some(("p=", value)) => {
                proof = Some(value);
                // AuthMessage ends right before ",p=".
                without_proof_len = client_final.len() - attr.len() - 1;
            }
            _ => {}
        }
    }

    // `biws` is base64("n,,"), the only binding we advertised.
    if channel_binding != Some("biws") {
        return Err(ScramError::ChannelBinding);
    }
    if nonce != Some(scratch.full_nonce.as_str()) {
        return Err(ScramError::NonceMismatch);
    }
    let proof = BASE64
        .decode(proof.ok_or(ScramError::Malformed("missing p="))?)
        .map_err(|_| ScramError::Malformed("proof not base64"))?;

    let auth_message = format!(
        "{},{},{}",
        scratch.client_first_bare,
        scratch.server_first,
        &client_final[..without_proof_len]
    );

    let client_signature = hmac(&credentials.stored_key, auth_message.as_bytes());
    if proof.len() != client_signature.len() {
        return Err(ScramError::BadProof);
    }

    let client_key: Vec<u8> = proof
        .iter()
        .zip(client_signature.iter())
        .map(|(p, s)| p ^ s)
        .collect();

    if Sha256::digest(&client_key).as_slice() != credentials.stored_key.as_slice() {
        return Err(ScramError::BadProof);
    }

    let server_signature = hmac(&credentials.server_key, auth_message.as_bytes());
    Ok(format!("v={}", BASE64.encode(server_signature)))
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Undo `=2C` / `=3D` escaping in a saslname.
fn unescape_saslname(name: &str) -> Result<String, ScramError> {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;

    while let Some(pos) = rest.find('=') {
        out.push_str(&rest[..pos]);
        match rest.get(pos + 1..pos + 3) {
            Some("2C") => out.push(','),
            Some("3D") => out.push('='),
            _ => return Err(ScramError::Malformed("bad saslname escape")),
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);

    Ok(out)
}

/// Derive the credentials a realm would store for `password`.
///
/// `SaltedPassword := Hi(password, salt, i)`, then
/// `StoredKey := H(HMAC(SaltedPassword, "Client Key"))` and
/// `ServerKey := HMAC(SaltedPassword, "Server Key")`.
pub fn derive_credentials(password: &str, salt: &[u8], iterations: u32) -> ScramCredentials {
    let salted = hi(password.as_bytes(), salt, iterations);
    let client_key = hmac(&salted, b"Client Key");
    let server_key = hmac(&salted, b"Server Key");

    ScramCredentials {
        salt: salt.to_vec(),
        iterations,
        stored_key: Sha256::digest(&client_key).to_vec(),
        server_key,
    }
}

/// PBKDF2-style iterated HMAC from RFC 5802 §2.2.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut block = Vec::with_capacity(salt.len() + 4);
    block.extend_from_slice(salt);
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac(password, &block);
    let mut result = u.clone();

    for _ in 1..iterations {
        u = hmac(password, &u);
        for (acc, byte) in result.iter_mut().zip(u.iter()) {
            *acc ^= byte;
        }
    }

    result
}
