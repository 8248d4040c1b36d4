//! # mailgate
//!
//! A mail-access server core speaking IMAP4rev2 ([RFC 9051]) and POP3
//! ([RFC 1939] with the CAPA/SASL/STLS extensions), over plain TCP or
//! TLS — implicit (IMAPS/POP3S) or upgraded in-band (STARTTLS/STLS).
//!
//! The crate is organised around synchronous per-connection protocol
//! engines ([`imap::ImapSession`], [`pop3::Pop3Session`]) that consume
//! framed bytes and enqueue responses on an [`endpoint::Endpoint`]. The
//! engines are policy: line framing, session state machines, command
//! dispatch, SASL negotiation, and response generation. Mechanism lives
//! behind three traits the embedding application provides:
//!
//! * [`realm::Realm`] — the user database and credential verification;
//! * [`store::MailStore`] — hierarchical message storage with UID
//!   assignment;
//! * [`quota::QuotaManager`] — storage accounting.
//!
//! The [`net`] module supplies a tokio driver realising the endpoint
//! contract over TCP with rustls, one task per connection. Everything
//! above it is I/O-free and runs unchanged against the in-memory
//! endpoint in tests (see [`testing`]).
//!
//! [RFC 9051]: https://www.rfc-editor.org/rfc/rfc9051.html
//! [RFC 1939]: https://www.rfc-editor.org/rfc/rfc1939.html

pub mod config;
pub mod endpoint;
pub mod error;
pub mod framer;
pub mod imap;
pub mod net;
pub mod pop3;
pub mod quota;
pub mod realm;
pub mod sasl;
pub mod secret;
pub mod store;
pub mod testing;

pub use config::{ImapConfig, Pop3Config};
pub use endpoint::{BufferedEndpoint, Endpoint, SecurityInfo};
pub use error::{FatalError, RealmError, StoreError};
pub use imap::{ImapContext, ImapSession};
pub use pop3::{Pop3Context, Pop3Session};
pub use quota::{NoQuota, Quota, QuotaManager};
pub use realm::{Lookup, Realm};
pub use store::{MailStore, Mailbox, UserStore};
