//! The SEARCH key tree.
//!
//! The engine parses the RFC 9051 search grammar into this AST and hands
//! it to the mailbox store for evaluation; matching itself is the store's
//! concern. IMAP has no dedicated AND operator — concatenated keys AND
//! implicitly, which the [`SearchKey::And`] variant makes explicit.

use chrono::NaiveDate;

use crate::imap::sequence::SequenceSet;

/// A node of the search tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchKey {
    /// All listed keys must match.
    And(Vec<SearchKey>),

    /// Messages with these sequence numbers.
    SequenceSet(SequenceSet),

    /// All messages in the mailbox; the neutral element of `And`.
    All,

    /// Messages with the `\Answered` flag set.
    Answered,

    /// Substring match on the BCC field.
    Bcc(String),

    /// Internal date strictly earlier than the given date.
    Before(NaiveDate),

    /// Substring match on the message body.
    Body(String),

    /// Substring match on the CC field.
    Cc(String),

    /// Messages with the `\Deleted` flag set.
    Deleted,

    /// Messages with the `\Draft` flag set.
    Draft,

    /// Messages with the `\Flagged` flag set.
    Flagged,

    /// Substring match on the FROM field.
    From(String),

    /// Header with the given field-name containing the given string.
    Header(String, String),

    /// Messages with the given keyword flag set.
    Keyword(String),

    /// RFC 5322 size larger than the given number of octets.
    Larger(u32),

    /// `\Recent` but not `\Seen`; equivalent to `(RECENT UNSEEN)`.
    New,

    Not(Box<SearchKey>),

    /// Messages without the `\Recent` flag.
    Old,

    /// Internal date within the given day.
    On(NaiveDate),

    Or(Box<SearchKey>, Box<SearchKey>),

    Recent,

    Seen,

    /// Date: header earlier than the given date.
    SentBefore(NaiveDate),

    /// Date: header within the given day.
    SentOn(NaiveDate),

    /// Date: header on or after the given date.
    SentSince(NaiveDate),

    /// Internal date on or after the given date.
    Since(NaiveDate),

    /// RFC 5322 size smaller than the given number of octets.
    Smaller(u32),

    /// Substring match on the SUBJECT field.
    Subject(String),

    /// Substring match on header or body.
    Text(String),

    /// Substring match on the TO field.
    To(String),

    /// Messages with these UIDs.
    Uid(SequenceSet),

    Unanswered,

    Undeleted,

    Undraft,

    Unflagged,

    /// Messages without the given keyword flag.
    Unkeyword(String),

    Unseen,
}
