//! Engine-visible error taxonomy.
//!
//! Failures raised by the identity realm or the mailbox store are caught at
//! the command handler and translated into protocol replies; they never
//! propagate past the engine. Only the variants of [`FatalError`] terminate
//! a connection.

use thiserror::Error;

/// Failures that terminate the connection.
///
/// The engine announces them to the peer (IMAP `* BYE`, POP3 `-ERR`)
/// before the transport is closed.
#[derive(Debug, Error)]
pub enum FatalError {
    /// A command line exceeded the configured maximum length.
    #[error("line exceeds maximum length of {0} octets")]
    LineTooLong(usize),

    /// A line was terminated by a bare LF instead of CRLF.
    #[error("line not terminated by CRLF")]
    NotCrLf,

    /// The literal byte counter and the framing buffer disagree.
    #[error("inconsistent literal state")]
    LiteralDesync,

    /// The transport failed underneath the engine.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Failures raised by a mailbox store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such mailbox: {0}")]
    NoSuchMailbox(String),

    #[error("mailbox already exists: {0}")]
    MailboxExists(String),

    #[error("no such message: {0}")]
    NoSuchMessage(u32),

    #[error("mailbox is read-only")]
    ReadOnly,

    #[error("operation not permitted: {0}")]
    Denied(String),

    #[error("storage failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Failures raised by an identity realm implementation.
#[derive(Debug, Error)]
pub enum RealmError {
    #[error("realm backend failure: {0}")]
    Backend(String),
}
