//! Server side of DIGEST-MD5 (RFC 2831).
//!
//! The full `response=` hash is recomputed from the realm-provided HA1 and
//! compared; validating the username alone is not sufficient.

use md5::{Digest, Md5};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestError {
    #[error("malformed digest response: {0}")]
    Malformed(&'static str),

    #[error("nonce mismatch")]
    NonceMismatch,

    #[error("unsupported qop: {0}")]
    UnsupportedQop(String),
}

/// Build the initial server challenge.
pub fn challenge(realm: &str, nonce: &str) -> String {
    format!(
        "realm=\"{realm}\",nonce=\"{nonce}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess"
    )
}

/// The fields of a `digest-response` the server verifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestResponse {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub cnonce: String,
    pub nonce_count: String,
    pub digest_uri: String,
    pub response: String,
    pub qop: String,
}

/// Parse the comma-separated `key=value` map, honouring quoted values.
pub fn parse_response(input: &str) -> Result<DigestResponse, DigestError> {
    let mut username = None;
    let mut realm = None;
    let mut nonce = None;
    let mut cnonce = None;
    let mut nonce_count = None;
    let mut digest_uri = None;
    let mut response = None;
    let mut qop = None;

    for (key, value) in split_pairs(input)? {
        match key.as_str() {
            "username" => username = Some(value),
            "realm" => realm = Some(value),
            "nonce" => nonce = Some(value),
            "cnonce" => cnonce = Some(value),
            "nc" => nonce_count = Some(value),
            "digest-uri" => digest_uri = Some(value),
            "response" => response = Some(value),
            "qop" => qop = Some(value),
            _ => {}
        }
    }

    Ok(DigestResponse {
        username: username.ok_or(DigestError::Malformed("missing username"))?,
        realm: realm.unwrap_or_default(),
        nonce: nonce.ok_or(DigestError::Malformed("missing nonce"))?,
        cnonce: cnonce.ok_or(DigestError::Malformed("missing cnonce"))?,
        nonce_count: nonce_count.unwrap_or_else(|| "00000001".to_owned()),
        digest_uri: digest_uri.ok_or(DigestError::Malformed("missing digest-uri"))?,
        response: response.ok_or(DigestError::Malformed("missing response"))?,
        qop: qop.unwrap_or_else(|| "auth".to_owned()),
    })
}

/// Verify the response hash against the HA1 the realm produced for
/// (username, realm). `ha1_hex` is `hex(MD5(username:realm:password))`.
pub fn verify(
    parsed: &DigestResponse,
    ha1_hex: &str,
    expected_nonce: &str,
) -> Result<bool, DigestError> {
    if parsed.nonce != expected_nonce {
        return Err(DigestError::NonceMismatch);
    }
    if !parsed.qop.eq_ignore_ascii_case("auth") {
        return Err(DigestError::UnsupportedQop(parsed.qop.clone()));
    }

    let ha1_raw =
        unhex(ha1_hex).ok_or(DigestError::Malformed("realm returned malformed HA1"))?;

    // A1 = H(username:realm:passwd) ":" nonce ":" cnonce  (md5-sess)
    let mut a1 = ha1_raw;
    a1.extend_from_slice(format!(":{}:{}", parsed.nonce, parsed.cnonce).as_bytes());
    let ha1 = hex(&Md5::digest(&a1));

    // A2 = "AUTHENTICATE:" digest-uri  (qop=auth)
    let ha2 = hex(&Md5::digest(
        format!("AUTHENTICATE:{}", parsed.digest_uri).as_bytes(),
    ));

    let expected = hex(&Md5::digest(
        format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, parsed.nonce, parsed.nonce_count, parsed.cnonce, parsed.qop, ha2
        )
        .as_bytes(),
    ));

    Ok(expected.eq_ignore_ascii_case(&parsed.response))
}

fn split_pairs(input: &str) -> Result<Vec<(String, String)>, DigestError> {
    let mut pairs = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        // Key up to '='.
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' {
            i += 1;
        }
        if i == bytes.len() {
            return Err(DigestError::Malformed("key without value"));
        }
        let key = input[key_start..i].trim().to_ascii_lowercase();
        i += 1;

        let value = if bytes.get(i) == Some(&b'"') {
            i += 1;
            let mut value = String::new();
            loop {
                match bytes.get(i) {
                    Some(b'"') => {
                        i += 1;
                        break;
                    }
                    Some(b'\\') => {
                        let escaped = *bytes
                            .get(i + 1)
                            .ok_or(DigestError::Malformed("dangling escape"))?;
                        value.push(escaped as char);
                        i += 2;
                    }
                    Some(byte) => {
                        value.push(*byte as char);
                        i += 1;
                    }
                    None => return Err(DigestError::Malformed("unterminated quote")),
                }
            }
            value
        } else {
            let value_start = i;
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            input[value_start..i].trim().to_owned()
        };

        pairs.push((key, value));

        // Skip the separating comma.
        if bytes.get(i) == Some(&b',') {
            i += 1;
        }
    }

    Ok(pairs)
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn unhex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
