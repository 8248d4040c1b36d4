//! Typed server responses and their wire encoding.
//!
//! Every response implements [`Encode`]; the engine serialises into its
//! endpoint buffer, CRLF included. IMAP traces are not guaranteed to be
//! UTF-8 (literals carry arbitrary octets), so encoding writes bytes, not
//! `Display` strings.

use std::io::Write;

use chrono::{DateTime, FixedOffset};

use crate::{
    imap::{command::StatusItem, command::Tag, datetime::format_date_time},
    sasl::Mechanism,
    store::{Flag, MailboxInfo},
};

/// Serialisation into the wire form.
pub trait Encode {
    fn encode(&self, writer: &mut dyn Write) -> std::io::Result<()>;

    /// Encode into a fresh buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out).expect("writing to a Vec cannot fail");
        out
    }
}

/// A capability the server may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Imap4Rev2,
    StartTls,
    LoginDisabled,
    Auth(Mechanism),
    Idle,
    Namespace,
    Quota,
    QuotaResStorage,
    Move,
    Unselect,
    LiteralPlus,
}

impl Capability {
    fn write(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        match self {
            Capability::Imap4Rev2 => write!(writer, "IMAP4rev2"),
            Capability::StartTls => write!(writer, "STARTTLS"),
            Capability::LoginDisabled => write!(writer, "LOGINDISABLED"),
            Capability::Auth(mechanism) => write!(writer, "AUTH={mechanism}"),
            Capability::Idle => write!(writer, "IDLE"),
            Capability::Namespace => write!(writer, "NAMESPACE"),
            Capability::Quota => write!(writer, "QUOTA"),
            Capability::QuotaResStorage => write!(writer, "QUOTA=RES-STORAGE"),
            Capability::Move => write!(writer, "MOVE"),
            Capability::Unselect => write!(writer, "UNSELECT"),
            Capability::LiteralPlus => write!(writer, "LITERAL+"),
        }
    }
}

/// A response code, carried in brackets inside a status response.
#[derive(Debug, Clone, PartialEq)]
pub enum Code {
    Capability(Vec<Capability>),
    /// `PERMANENTFLAGS (... \*)`
    PermanentFlags(Vec<Flag>),
    ReadOnly,
    ReadWrite,
    UidValidity(u32),
    UidNext(u32),
    AppendUid { validity: u32, uid: u32 },
    TryCreate,
    OverQuota,
    AuthenticationFailed,
    PrivacyRequired,
    Alert,
}

impl Code {
    fn write(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        match self {
            Code::Capability(caps) => {
                write!(writer, "CAPABILITY")?;
                for cap in caps {
                    write!(writer, " ")?;
                    cap.write(writer)?;
                }
                Ok(())
            }
            Code::PermanentFlags(flags) => {
                write!(writer, "PERMANENTFLAGS (")?;
                for flag in flags {
                    write!(writer, "{flag} ")?;
                }
                write!(writer, "\\*)")
            }
            Code::ReadOnly => write!(writer, "READ-ONLY"),
            Code::ReadWrite => write!(writer, "READ-WRITE"),
            Code::UidValidity(v) => write!(writer, "UIDVALIDITY {v}"),
            Code::UidNext(v) => write!(writer, "UIDNEXT {v}"),
            Code::AppendUid { validity, uid } => write!(writer, "APPENDUID {validity} {uid}"),
            Code::TryCreate => write!(writer, "TRYCREATE"),
            Code::OverQuota => write!(writer, "OVERQUOTA"),
            Code::AuthenticationFailed => write!(writer, "AUTHENTICATIONFAILED"),
            Code::PrivacyRequired => write!(writer, "PRIVACYREQUIRED"),
            Code::Alert => write!(writer, "ALERT"),
        }
    }
}

/// A status response: tagged completion result or untagged OK/BYE.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Ok {
        tag: Option<Tag>,
        code: Option<Code>,
        text: String,
    },
    No {
        tag: Tag,
        code: Option<Code>,
        text: String,
    },
    Bad {
        /// `None` renders the reserved tag `*`, used when the client's tag
        /// itself was unusable.
        tag: Option<Tag>,
        text: String,
    },
    Bye {
        text: String,
    },
}

impl Status {
    pub fn ok(tag: Tag, code: Option<Code>, text: impl Into<String>) -> Self {
        Status::Ok {
            tag: Some(tag),
            code,
            text: text.into(),
        }
    }

    pub fn no(tag: Tag, code: Option<Code>, text: impl Into<String>) -> Self {
        Status::No {
            tag,
            code,
            text: text.into(),
        }
    }

    pub fn bad(tag: Tag, text: impl Into<String>) -> Self {
        Status::Bad {
            tag: Some(tag),
            text: text.into(),
        }
    }

    pub fn bye(text: impl Into<String>) -> Self {
        Status::Bye { text: text.into() }
    }
}

impl Encode for Status {
    fn encode(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        match self {
            Status::Ok { tag, code, text } => {
                match tag {
                    Some(tag) => write!(writer, "{tag} OK ")?,
                    None => write!(writer, "* OK ")?,
                }
                if let Some(code) = code {
                    write!(writer, "[")?;
                    code.write(writer)?;
                    write!(writer, "] ")?;
                }
                write!(writer, "{text}\r\n")
            }
            Status::No { tag, code, text } => {
                write!(writer, "{tag} NO ")?;
                if let Some(code) = code {
                    write!(writer, "[")?;
                    code.write(writer)?;
                    write!(writer, "] ")?;
                }
                write!(writer, "{text}\r\n")
            }
            Status::Bad { tag, text } => {
                match tag {
                    Some(tag) => write!(writer, "{tag} BAD ")?,
                    None => write!(writer, "* BAD ")?,
                }
                write!(writer, "{text}\r\n")
            }
            Status::Bye { text } => write!(writer, "* BYE {text}\r\n"),
        }
    }
}

/// An attribute inside a FETCH response.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchValue {
    Uid(u32),
    Flags(Vec<Flag>),
    Rfc822Size(u64),
    InternalDate(DateTime<FixedOffset>),
    /// `BODY[]` — the whole message as a literal.
    Body(Vec<u8>),
}

impl FetchValue {
    fn write(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        match self {
            FetchValue::Uid(uid) => write!(writer, "UID {uid}"),
            FetchValue::Flags(flags) => {
                write!(writer, "FLAGS (")?;
                write_flags(writer, flags)?;
                write!(writer, ")")
            }
            FetchValue::Rfc822Size(size) => write!(writer, "RFC822.SIZE {size}"),
            FetchValue::InternalDate(date) => {
                write!(writer, "INTERNALDATE \"{}\"", format_date_time(date))
            }
            FetchValue::Body(content) => {
                write!(writer, "BODY[] {{{}}}\r\n", content.len())?;
                writer.write_all(content)
            }
        }
    }
}

/// Untagged data responses.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Capability(Vec<Capability>),
    Exists(u32),
    Recent(u32),
    Flags(Vec<Flag>),
    List {
        info: MailboxInfo,
        delimiter: char,
    },
    Lsub {
        info: MailboxInfo,
        delimiter: char,
    },
    Status {
        mailbox: String,
        items: Vec<(StatusItem, u64)>,
    },
    Search(Vec<u32>),
    Expunge(u32),
    Fetch {
        seq: u32,
        values: Vec<FetchValue>,
    },
    Namespace {
        prefix: String,
        delimiter: char,
    },
    Quota {
        root: String,
        /// `(name usage limit)` triples, already scaled for the wire.
        resources: Vec<(&'static str, u64, u64)>,
    },
    QuotaRoot {
        mailbox: String,
        roots: Vec<String>,
    },
}

impl Encode for Data {
    fn encode(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        match self {
            Data::Capability(caps) => {
                write!(writer, "* CAPABILITY")?;
                for cap in caps {
                    write!(writer, " ")?;
                    cap.write(writer)?;
                }
                write!(writer, "\r\n")
            }
            Data::Exists(n) => write!(writer, "* {n} EXISTS\r\n"),
            Data::Recent(n) => write!(writer, "* {n} RECENT\r\n"),
            Data::Flags(flags) => {
                write!(writer, "* FLAGS (")?;
                write_flags(writer, flags)?;
                write!(writer, ")\r\n")
            }
            Data::List { info, delimiter } => write_list_row(writer, "LIST", info, *delimiter),
            Data::Lsub { info, delimiter } => write_list_row(writer, "LSUB", info, *delimiter),
            Data::Status { mailbox, items } => {
                write!(writer, "* STATUS ")?;
                write_mailbox(writer, mailbox)?;
                write!(writer, " (")?;
                for (i, (item, value)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(writer, " ")?;
                    }
                    write!(writer, "{} {value}", item.name())?;
                }
                write!(writer, ")\r\n")
            }
            Data::Search(numbers) => {
                write!(writer, "* SEARCH")?;
                for n in numbers {
                    write!(writer, " {n}")?;
                }
                write!(writer, "\r\n")
            }
            Data::Expunge(n) => write!(writer, "* {n} EXPUNGE\r\n"),
            Data::Fetch { seq, values } => {
                write!(writer, "* {seq} FETCH (")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(writer, " ")?;
                    }
                    value.write(writer)?;
                }
                write!(writer, ")\r\n")
            }
            Data::Namespace { prefix, delimiter } => {
                write!(writer, "* NAMESPACE ((")?;
                write_mailbox(writer, prefix)?;
                write!(writer, " \"{delimiter}\")) NIL NIL\r\n")
            }
            Data::Quota { root, resources } => {
                write!(writer, "* QUOTA ")?;
                write_mailbox(writer, root)?;
                write!(writer, " (")?;
                for (i, (name, usage, limit)) in resources.iter().enumerate() {
                    if i > 0 {
                        write!(writer, " ")?;
                    }
                    write!(writer, "{name} {usage} {limit}")?;
                }
                write!(writer, ")\r\n")
            }
            Data::QuotaRoot { mailbox, roots } => {
                write!(writer, "* QUOTAROOT ")?;
                write_mailbox(writer, mailbox)?;
                for root in roots {
                    write!(writer, " ")?;
                    write_mailbox(writer, root)?;
                }
                write!(writer, "\r\n")
            }
        }
    }
}

/// A command continuation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continue {
    /// `+ <text>`
    Basic(String),
    /// `+ <base64 payload>` — SASL challenges.
    Base64(Vec<u8>),
}

impl Encode for Continue {
    fn encode(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        match self {
            Continue::Basic(text) => write!(writer, "+ {text}\r\n"),
            Continue::Base64(data) => {
                use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
                write!(writer, "+ {}\r\n", BASE64.encode(data))
            }
        }
    }
}

fn write_flags(writer: &mut dyn Write, flags: &[Flag]) -> std::io::Result<()> {
    for (i, flag) in flags.iter().enumerate() {
        if i > 0 {
            write!(writer, " ")?;
        }
        write!(writer, "{flag}")?;
    }
    Ok(())
}

fn write_list_row(
    writer: &mut dyn Write,
    keyword: &str,
    info: &MailboxInfo,
    delimiter: char,
) -> std::io::Result<()> {
    write!(writer, "* {keyword} (")?;
    let mut attrs: Vec<&str> = Vec::new();
    if info.no_select {
        attrs.push("\\Noselect");
    }
    if info.has_children {
        attrs.push("\\HasChildren");
    }
    write!(writer, "{}", attrs.join(" "))?;
    write!(writer, ") \"{delimiter}\" ")?;
    write_mailbox(writer, &info.name)?;
    write!(writer, "\r\n")
}

/// Quote a mailbox name (or quota root) when the bare form would be
/// ambiguous on the wire.
fn write_mailbox(writer: &mut dyn Write, name: &str) -> std::io::Result<()> {
    let needs_quoting = name.is_empty()
        || name
            .bytes()
            .any(|b| matches!(b, b' ' | b'"' | b'\\' | b'(' | b')' | b'{' | b'%' | b'*')
                || !(0x21..=0x7e).contains(&b));

    if needs_quoting {
        write!(writer, "\"")?;
        for byte in name.bytes() {
            if byte == b'"' || byte == b'\\' {
                writer.write_all(&[b'\\'])?;
            }
            writer.write_all(&[byte])?;
        }
        write!(writer, "\"")
    } else {
        write!(writer, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(item: &impl Encode) -> String {
        String::from_utf8(item.to_bytes()).unwrap()
    }

    #[test]
    fn test_status_encoding() {
        let tag = Tag::try_from("a1").unwrap();

        assert_eq!(
            encoded(&Status::ok(tag.clone(), None, "NOOP completed")),
            "a1 OK NOOP completed\r\n"
        );
        assert_eq!(
            encoded(&Status::ok(
                tag.clone(),
                Some(Code::ReadWrite),
                "Select completed"
            )),
            "a1 OK [READ-WRITE] Select completed\r\n"
        );
        assert_eq!(
            encoded(&Status::no(
                tag.clone(),
                Some(Code::AuthenticationFailed),
                "Bad credentials"
            )),
            "a1 NO [AUTHENTICATIONFAILED] Bad credentials\r\n"
        );
        assert_eq!(
            encoded(&Status::Bad {
                tag: None,
                text: "Invalid tag".into()
            }),
            "* BAD Invalid tag\r\n"
        );
        assert_eq!(
            encoded(&Status::bye("Autologout")),
            "* BYE Autologout\r\n"
        );
    }

    #[test]
    fn test_append_uid_code() {
        let tag = Tag::try_from("a3").unwrap();
        assert_eq!(
            encoded(&Status::ok(
                tag,
                Some(Code::AppendUid {
                    validity: 38505,
                    uid: 3955
                }),
                "APPEND completed"
            )),
            "a3 OK [APPENDUID 38505 3955] APPEND completed\r\n"
        );
    }

    #[test]
    fn test_untagged_data() {
        assert_eq!(encoded(&Data::Exists(23)), "* 23 EXISTS\r\n");
        assert_eq!(encoded(&Data::Expunge(3)), "* 3 EXPUNGE\r\n");
        assert_eq!(
            encoded(&Data::Flags(vec![Flag::Seen, Flag::Deleted])),
            "* FLAGS (\\Seen \\Deleted)\r\n"
        );
        assert_eq!(
            encoded(&Data::Search(vec![2, 84, 882])),
            "* SEARCH 2 84 882\r\n"
        );
        assert_eq!(encoded(&Data::Search(vec![])), "* SEARCH\r\n");
    }

    #[test]
    fn test_list_row_quotes_when_needed() {
        let row = Data::List {
            info: MailboxInfo {
                name: "My Folder".into(),
                no_select: false,
                has_children: true,
            },
            delimiter: '/',
        };
        assert_eq!(
            encoded(&row),
            "* LIST (\\HasChildren) \"/\" \"My Folder\"\r\n"
        );

        let row = Data::List {
            info: MailboxInfo {
                name: "INBOX".into(),
                no_select: false,
                has_children: false,
            },
            delimiter: '/',
        };
        assert_eq!(encoded(&row), "* LIST () \"/\" INBOX\r\n");
    }

    #[test]
    fn test_fetch_with_body_literal() {
        let data = Data::Fetch {
            seq: 2,
            values: vec![
                FetchValue::Uid(7),
                FetchValue::Body(b"Subject: hi\r\n\r\nhello\r\n".to_vec()),
            ],
        };
        assert_eq!(
            encoded(&data),
            "* 2 FETCH (UID 7 BODY[] {22}\r\nSubject: hi\r\n\r\nhello\r\n)\r\n"
        );
    }

    #[test]
    fn test_continuation() {
        assert_eq!(
            encoded(&Continue::Basic("Ready for literal data".into())),
            "+ Ready for literal data\r\n"
        );
        assert_eq!(encoded(&Continue::Base64(b"abc".to_vec())), "+ YWJj\r\n");
        assert_eq!(encoded(&Continue::Base64(Vec::new())), "+ \r\n");
    }

    #[test]
    fn test_capability_line() {
        let data = Data::Capability(vec![
            Capability::Imap4Rev2,
            Capability::StartTls,
            Capability::Auth(Mechanism::ScramSha256),
        ]);
        assert_eq!(
            encoded(&data),
            "* CAPABILITY IMAP4rev2 STARTTLS AUTH=SCRAM-SHA-256\r\n"
        );
    }
}
