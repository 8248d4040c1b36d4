//! The mailbox store: hierarchical message storage with UID assignment.
//!
//! The engines mediate access to these traits but never interpret message
//! bodies themselves; content flows through them as opaque byte streams.
//! A store must guarantee serialisability of operations on a single user's
//! mailbox, typically via file locking or store-internal locking.

use std::io::Read;

use chrono::{DateTime, FixedOffset};

use crate::{error::StoreError, imap::search::SearchKey};

/// A message system flag or keyword.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
    Recent,
    /// A user-defined keyword.
    Keyword(String),
}

impl Flag {
    /// Parse the wire form, e.g. `\Seen` or `gardening`.
    pub fn from_wire(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "\\seen" => Flag::Seen,
            "\\answered" => Flag::Answered,
            "\\flagged" => Flag::Flagged,
            "\\deleted" => Flag::Deleted,
            "\\draft" => Flag::Draft,
            "\\recent" => Flag::Recent,
            _ => Flag::Keyword(s.to_owned()),
        }
    }
}

impl std::fmt::Display for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Flag::Seen => f.write_str("\\Seen"),
            Flag::Answered => f.write_str("\\Answered"),
            Flag::Flagged => f.write_str("\\Flagged"),
            Flag::Deleted => f.write_str("\\Deleted"),
            Flag::Draft => f.write_str("\\Draft"),
            Flag::Recent => f.write_str("\\Recent"),
            Flag::Keyword(word) => f.write_str(word),
        }
    }
}

/// How a STORE command combines flags with the existing set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOp {
    Replace,
    Add,
    Remove,
}

/// Descriptor of a stored message.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    /// 1-based position in the mailbox.
    pub sequence: u32,
    pub uid: u32,
    /// RFC 5322 size in octets.
    pub size: u64,
    pub flags: Vec<Flag>,
    pub internal_date: DateTime<FixedOffset>,
}

/// A row of a LIST or LSUB reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxInfo {
    pub name: String,
    /// `\Noselect`: the name exists in the hierarchy but holds no messages.
    pub no_select: bool,
    /// `\HasChildren`.
    pub has_children: bool,
}

/// Counters served to STATUS without selecting the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxAttributes {
    pub messages: u32,
    pub unseen: u32,
    pub uid_validity: u32,
    pub uid_next: u32,
    pub size: u64,
}

/// An event pushed by the store while a connection is idling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxEvent {
    /// The message count changed; the new count is attached.
    Exists(u32),
    Recent(u32),
    /// The message at this sequence number was expunged.
    Expunge(u32),
}

/// Entry point shared across connections.
pub trait MailStore: Send + Sync {
    /// Open the per-session view of one user's storage.
    fn open(&self, user: &str) -> Result<Box<dyn UserStore>, StoreError>;
}

/// One authenticated session's view of a user's mailbox hierarchy.
pub trait UserStore: Send {
    fn open_mailbox(&mut self, name: &str, read_only: bool)
        -> Result<Box<dyn Mailbox>, StoreError>;

    fn create_mailbox(&mut self, name: &str) -> Result<(), StoreError>;

    fn delete_mailbox(&mut self, name: &str) -> Result<(), StoreError>;

    fn rename_mailbox(&mut self, from: &str, to: &str) -> Result<(), StoreError>;

    fn subscribe(&mut self, name: &str) -> Result<(), StoreError>;

    fn unsubscribe(&mut self, name: &str) -> Result<(), StoreError>;

    /// All mailbox names matching `pattern` (with `%` and `*` wildcards)
    /// interpreted relative to `reference`.
    fn list(&self, reference: &str, pattern: &str) -> Result<Vec<MailboxInfo>, StoreError>;

    fn list_subscribed(&self, reference: &str, pattern: &str)
        -> Result<Vec<MailboxInfo>, StoreError>;

    fn hierarchy_delimiter(&self) -> char;

    /// Prefix of the personal namespace, usually empty.
    fn personal_namespace(&self) -> String;

    fn mailbox_attributes(&self, name: &str) -> Result<MailboxAttributes, StoreError>;

    /// Release the session view. Open mailboxes are closed without expunge.
    fn close(&mut self);
}

/// An open mailbox bound to one session.
pub trait Mailbox: Send {
    fn name(&self) -> &str;

    fn message_count(&self) -> u32;

    /// Sum of message sizes in octets.
    fn mailbox_size(&self) -> u64;

    fn uid_validity(&self) -> u32;

    fn uid_next(&self) -> u32;

    fn permanent_flags(&self) -> Vec<Flag>;

    fn is_deleted(&self, seq: u32) -> bool;

    /// Mark one message `\Deleted`.
    fn delete_message(&mut self, seq: u32) -> Result<(), StoreError>;

    /// Clear `\Deleted` everywhere (POP3 RSET).
    fn undelete_all(&mut self);

    /// Remove all `\Deleted` messages; returns their former sequence
    /// numbers in descending order.
    fn expunge(&mut self) -> Result<Vec<u32>, StoreError>;

    fn get_message(&self, seq: u32) -> Result<MessageMeta, StoreError>;

    fn get_message_content(&self, seq: u32) -> Result<Box<dyn Read + Send>, StoreError>;

    /// Headers plus the first `lines` body lines (POP3 TOP).
    fn get_message_top(&self, seq: u32, lines: u32) -> Result<Box<dyn Read + Send>, StoreError>;

    /// Stable unique identifier (POP3 UIDL).
    fn get_unique_id(&self, seq: u32) -> Result<String, StoreError>;

    fn get_message_list(&self) -> Result<Vec<MessageMeta>, StoreError>;

    /// Evaluate a search tree; returns matching sequence numbers.
    fn search(&self, criteria: &SearchKey) -> Result<Vec<u32>, StoreError>;

    /// Combine `flags` into the message's flag set; returns the resulting
    /// set.
    fn store_flags(&mut self, seq: u32, op: FlagOp, flags: &[Flag])
        -> Result<Vec<Flag>, StoreError>;

    /// Begin an append transaction. Content arrives through
    /// `append_content`; `end_append` assigns the UID.
    fn start_append(
        &mut self,
        flags: &[Flag],
        internal_date: Option<DateTime<FixedOffset>>,
    ) -> Result<(), StoreError>;

    fn append_content(&mut self, bytes: &[u8]) -> Result<(), StoreError>;

    fn end_append(&mut self) -> Result<u32, StoreError>;

    /// Abandon an append transaction, discarding partial content.
    fn abort_append(&mut self);

    /// Events accumulated since the last call (IDLE push).
    fn drain_events(&mut self) -> Vec<MailboxEvent>;

    /// Release the mailbox, expunging `\Deleted` messages when asked.
    fn close(&mut self, expunge: bool) -> Result<(), StoreError>;
}
