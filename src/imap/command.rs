//! Typed IMAP commands.
//!
//! Commands are represented as a tagged variant per keyword; dispatch in
//! the engine is a match over this enum rather than string comparison.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, FixedOffset};
use thiserror::Error;

use crate::{
    imap::{search::SearchKey, sequence::SequenceSet},
    sasl::Mechanism,
    secret::Secret,
    store::{Flag, FlagOp},
};

/// A client-chosen command identifier, echoed in the tagged response.
///
/// `tag = 1*<any ASTRING-CHAR except "+">` — additionally the single
/// character `*` is reserved for untagged responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("tag must not be empty")]
    Empty,

    #[error("invalid byte in tag")]
    ByteNotAllowed,

    #[error("`*` and `+` are reserved")]
    Reserved,
}

impl Tag {
    pub fn verify(value: &str) -> Result<(), TagError> {
        if value.is_empty() {
            return Err(TagError::Empty);
        }
        if value == "*" || value == "+" {
            return Err(TagError::Reserved);
        }
        if !value.bytes().all(is_tag_char) {
            return Err(TagError::ByteNotAllowed);
        }

        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// `ASTRING-CHAR` minus `+`: graphic US-ASCII excluding
/// SP `(` `)` `{` `%` `*` `"` `\` and controls.
pub(crate) fn is_tag_char(byte: u8) -> bool {
    matches!(byte, 0x21..=0x7e)
        && !matches!(
            byte,
            b'(' | b')' | b'{' | b'%' | b'*' | b'"' | b'\\' | b'+'
        )
}

impl TryFrom<&str> for Tag {
    type Error = TagError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::verify(value)?;
        Ok(Tag(value.to_owned()))
    }
}

impl TryFrom<String> for Tag {
    type Error = TagError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::verify(&value)?;
        Ok(Tag(value))
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mailbox name. `INBOX` is case-insensitive and gets its own variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MailboxName {
    Inbox,
    Other(String),
}

impl MailboxName {
    pub fn from_wire(name: &str) -> Self {
        if name.eq_ignore_ascii_case("INBOX") {
            MailboxName::Inbox
        } else {
            MailboxName::Other(name.to_owned())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MailboxName::Inbox => "INBOX",
            MailboxName::Other(name) => name,
        }
    }
}

impl Display for MailboxName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes a STATUS command may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    UidNext,
    UidValidity,
    Unseen,
    Size,
}

impl StatusItem {
    pub fn name(&self) -> &'static str {
        match self {
            StatusItem::Messages => "MESSAGES",
            StatusItem::UidNext => "UIDNEXT",
            StatusItem::UidValidity => "UIDVALIDITY",
            StatusItem::Unseen => "UNSEEN",
            StatusItem::Size => "SIZE",
        }
    }
}

/// Message attributes a FETCH command may request.
///
/// Body parsing beyond the full content lives in the mailbox store; the
/// engine serves the attributes below and rejects the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchItem {
    Uid,
    Flags,
    Rfc822Size,
    InternalDate,
    /// `BODY[]` (and its peek variant).
    Body { peek: bool },
}

/// Quota resources of RFC 9208 the server accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaResource {
    /// Kibibytes of storage.
    Storage,
    /// Number of messages.
    Message,
}

impl QuotaResource {
    pub fn name(&self) -> &'static str {
        match self {
            QuotaResource::Storage => "STORAGE",
            QuotaResource::Message => "MESSAGE",
        }
    }
}

/// A complete command line: tag plus body.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub tag: Tag,
    pub body: CommandBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandBody {
    // Any state.
    Capability,
    Noop,
    Logout,

    // Not authenticated.
    StartTls,
    Authenticate {
        mechanism: Mechanism,
        /// Decoded initial response; IMAP `=` means present-but-empty.
        initial: Option<Vec<u8>>,
    },
    Login {
        username: String,
        password: Secret<String>,
    },

    // Authenticated (and selected).
    Select {
        mailbox: MailboxName,
    },
    Examine {
        mailbox: MailboxName,
    },
    Create {
        mailbox: MailboxName,
    },
    Delete {
        mailbox: MailboxName,
    },
    Rename {
        from: MailboxName,
        to: MailboxName,
    },
    Subscribe {
        mailbox: MailboxName,
    },
    Unsubscribe {
        mailbox: MailboxName,
    },
    List {
        reference: String,
        pattern: String,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Namespace,
    Status {
        mailbox: MailboxName,
        items: Vec<StatusItem>,
    },
    Append {
        mailbox: MailboxName,
        flags: Vec<Flag>,
        date: Option<DateTime<FixedOffset>>,
        /// Announced literal size in octets.
        size: u64,
        /// `{N+}`: the client sends the literal without awaiting `+`.
        non_sync: bool,
    },
    Idle,
    GetQuota {
        root: String,
    },
    GetQuotaRoot {
        mailbox: MailboxName,
    },
    SetQuota {
        root: String,
        limits: Vec<(QuotaResource, u64)>,
    },

    // Selected.
    Close,
    Unselect,
    Expunge,
    Search {
        criteria: SearchKey,
        uid: bool,
    },
    Fetch {
        set: SequenceSet,
        items: Vec<FetchItem>,
        uid: bool,
    },
    Store {
        set: SequenceSet,
        op: FlagOp,
        silent: bool,
        flags: Vec<Flag>,
        uid: bool,
    },
    Copy {
        set: SequenceSet,
        mailbox: MailboxName,
        uid: bool,
    },
    Move {
        set: SequenceSet,
        mailbox: MailboxName,
        uid: bool,
    },
}

impl CommandBody {
    /// The keyword, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            CommandBody::Capability => "CAPABILITY",
            CommandBody::Noop => "NOOP",
            CommandBody::Logout => "LOGOUT",
            CommandBody::StartTls => "STARTTLS",
            CommandBody::Authenticate { .. } => "AUTHENTICATE",
            CommandBody::Login { .. } => "LOGIN",
            CommandBody::Select { .. } => "SELECT",
            CommandBody::Examine { .. } => "EXAMINE",
            CommandBody::Create { .. } => "CREATE",
            CommandBody::Delete { .. } => "DELETE",
            CommandBody::Rename { .. } => "RENAME",
            CommandBody::Subscribe { .. } => "SUBSCRIBE",
            CommandBody::Unsubscribe { .. } => "UNSUBSCRIBE",
            CommandBody::List { .. } => "LIST",
            CommandBody::Lsub { .. } => "LSUB",
            CommandBody::Namespace => "NAMESPACE",
            CommandBody::Status { .. } => "STATUS",
            CommandBody::Append { .. } => "APPEND",
            CommandBody::Idle => "IDLE",
            CommandBody::GetQuota { .. } => "GETQUOTA",
            CommandBody::GetQuotaRoot { .. } => "GETQUOTAROOT",
            CommandBody::SetQuota { .. } => "SETQUOTA",
            CommandBody::Close => "CLOSE",
            CommandBody::Unselect => "UNSELECT",
            CommandBody::Expunge => "EXPUNGE",
            CommandBody::Search { .. } => "SEARCH",
            CommandBody::Fetch { .. } => "FETCH",
            CommandBody::Store { .. } => "STORE",
            CommandBody::Copy { .. } => "COPY",
            CommandBody::Move { .. } => "MOVE",
        }
    }
}
