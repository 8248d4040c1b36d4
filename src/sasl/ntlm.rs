//! Minimal server side of the NTLM handshake.
//!
//! The exchange is driven far enough to extract the account name from the
//! Type 3 message; hash validation against the domain controller is out of
//! scope and the realm is only asked whether the user exists.

use thiserror::Error;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const FLAG_UNICODE: u32 = 0x0000_0001;
const FLAG_OEM: u32 = 0x0000_0002;
const FLAG_NTLM: u32 = 0x0000_0200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NtlmError {
    #[error("not an NTLMSSP message")]
    BadSignature,

    #[error("unexpected NTLM message type {0}")]
    UnexpectedType(u32),

    #[error("truncated NTLM message")]
    Truncated,
}

/// Validate a Type 1 (negotiate) message and return the client flags.
pub fn parse_type1(message: &[u8]) -> Result<u32, NtlmError> {
    check_header(message, 1)?;

    let flags = message
        .get(12..16)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(FLAG_OEM);

    Ok(flags)
}

/// Build a Type 2 (challenge) message around an 8-byte server challenge.
pub fn type2(challenge: &[u8; 8], client_flags: u32) -> Vec<u8> {
    let flags = if client_flags & FLAG_UNICODE != 0 {
        FLAG_UNICODE | FLAG_NTLM
    } else {
        FLAG_OEM | FLAG_NTLM
    };

    let mut message = Vec::with_capacity(40);
    message.extend_from_slice(SIGNATURE);
    message.extend_from_slice(&2u32.to_le_bytes());
    // Empty target name security buffer pointing past the fixed part.
    message.extend_from_slice(&0u16.to_le_bytes());
    message.extend_from_slice(&0u16.to_le_bytes());
    message.extend_from_slice(&40u32.to_le_bytes());
    message.extend_from_slice(&flags.to_le_bytes());
    message.extend_from_slice(challenge);
    // Context, reserved.
    message.extend_from_slice(&[0u8; 8]);

    message
}

/// Extract the account name from a Type 3 (authenticate) message.
pub fn parse_type3_username(message: &[u8]) -> Result<String, NtlmError> {
    check_header(message, 3)?;

    let (offset, length) = security_buffer(message, 36)?;
    let raw = message
        .get(offset..offset + length)
        .ok_or(NtlmError::Truncated)?;

    // The name is UTF-16LE when the unicode flag was negotiated; detect it
    // from the interleaved zero bytes so a missing flags field still works.
    let is_utf16 = raw.len() >= 2 && raw.len() % 2 == 0 && raw[1] == 0;

    if is_utf16 {
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| NtlmError::Truncated)
    } else {
        Ok(String::from_utf8_lossy(raw).into_owned())
    }
}

fn check_header(message: &[u8], expected_type: u32) -> Result<(), NtlmError> {
    if message.len() < 12 {
        return Err(NtlmError::Truncated);
    }
    if &message[..8] != SIGNATURE {
        return Err(NtlmError::BadSignature);
    }

    let message_type = u32::from_le_bytes([message[8], message[9], message[10], message[11]]);
    if message_type != expected_type {
        return Err(NtlmError::UnexpectedType(message_type));
    }

    Ok(())
}

/// Read a (length, maxlength, offset) security buffer at `at`.
fn security_buffer(message: &[u8], at: usize) -> Result<(usize, usize), NtlmError> {
    let raw = message.get(at..at + 8).ok_or(NtlmError::Truncated)?;
    let length = u16::from_le_bytes([raw[0], raw[1]]) as usize;
    let offset = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;

    Ok((offset, length))
}
