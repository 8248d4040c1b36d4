//! Command-line parsing.
//!
//! Lines arrive here already framed (CRLF stripped). The grammar rules are
//! the RFC 9051 ones restricted to the command set the engine dispatches;
//! literals are only recognised in their APPEND position.

use std::str::from_utf8;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::digit1,
    combinator::{all_consuming, map, map_res, opt, value},
    multi::{separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, separated_pair, tuple},
    IResult,
};

use crate::{
    imap::{
        command::{
            Command, CommandBody, FetchItem, MailboxName, QuotaResource, StatusItem, Tag,
        },
        datetime::{parse_date, parse_date_time},
        search::SearchKey,
        sequence::SequenceSet,
    },
    sasl::Mechanism,
    secret::Secret,
    store::{Flag, FlagOp},
};

/// Why a command line was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The tag itself is unusable; the reply must be `* BAD`.
    BadTag,
    /// The tag parsed but the rest did not; reply tagged `BAD`.
    Bad { tag: Tag, message: String },
}

/// `command = tag SP command-body`
pub fn command(line: &[u8]) -> Result<Command, CommandError> {
    let (tag_bytes, rest) = match line.iter().position(|b| *b == b' ') {
        Some(at) => (&line[..at], &line[at + 1..]),
        None => (line, &line[line.len()..]),
    };

    let tag = from_utf8(tag_bytes)
        .ok()
        .and_then(|s| Tag::try_from(s).ok())
        .ok_or(CommandError::BadTag)?;

    // Permissive about trailing whitespace.
    let mut rest = rest;
    while rest.last() == Some(&b' ') {
        rest = &rest[..rest.len() - 1];
    }

    match all_consuming(command_body)(rest) {
        Ok((_, body)) => Ok(Command { tag, body }),
        Err(_) => Err(CommandError::Bad {
            message: bad_message(rest),
            tag,
        }),
    }
}

fn bad_message(rest: &[u8]) -> String {
    let keyword = rest
        .split(|b| *b == b' ')
        .next()
        .and_then(|word| from_utf8(word).ok())
        .unwrap_or_default()
        .to_ascii_uppercase();

    const KNOWN: &[&str] = &[
        "CAPABILITY", "NOOP", "LOGOUT", "STARTTLS", "AUTHENTICATE", "LOGIN", "SELECT", "EXAMINE",
        "CREATE", "DELETE", "RENAME", "SUBSCRIBE", "UNSUBSCRIBE", "LIST", "LSUB", "NAMESPACE",
        "STATUS", "APPEND", "IDLE", "GETQUOTA", "GETQUOTAROOT", "SETQUOTA", "CLOSE", "UNSELECT",
        "EXPUNGE", "SEARCH", "FETCH", "STORE", "COPY", "MOVE", "UID",
    ];

    if KNOWN.contains(&keyword.as_str()) {
        format!("Syntax error in {keyword} arguments")
    } else {
        "Unknown command".to_owned()
    }
}

fn command_body(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((command_any, command_nonauth, command_auth, command_select))(input)
}

/// `command-any = "CAPABILITY" / "LOGOUT" / "NOOP"`
///
/// Note: Valid in all states.
fn command_any(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((
        value(CommandBody::Capability, tag_no_case(b"CAPABILITY")),
        value(CommandBody::Logout, tag_no_case(b"LOGOUT")),
        value(CommandBody::Noop, tag_no_case(b"NOOP")),
    ))(input)
}

/// `command-nonauth = login / authenticate / "STARTTLS"`
///
/// Note: Valid only when in Not Authenticated state.
fn command_nonauth(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((
        value(CommandBody::StartTls, tag_no_case(b"STARTTLS")),
        authenticate,
        login,
    ))(input)
}

/// `authenticate = "AUTHENTICATE" SP auth-type [SP initial-resp]`
///
/// `initial-resp = (base64 / "=")` — `=` stands for a present-but-empty
/// response.
fn authenticate(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((
            tag_no_case(b"AUTHENTICATE"),
            sp,
            auth_type,
            opt(preceded(sp, initial_response)),
        )),
        |(_, _, mechanism, initial)| CommandBody::Authenticate { mechanism, initial },
    )(input)
}

fn auth_type(input: &[u8]) -> IResult<&[u8], Mechanism> {
    map_res(take_while1(is_atom_char), |bytes: &[u8]| {
        from_utf8(bytes)
            .map_err(|_| ())
            .and_then(|s| s.parse::<Mechanism>().map_err(|_| ()))
    })(input)
}

fn initial_response(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    alt((
        value(Vec::new(), tag(b"=")),
        map_res(take_while1(is_base64_char), |bytes: &[u8]| {
            BASE64.decode(bytes)
        }),
    ))(input)
}

/// `login = "LOGIN" SP userid SP password`
fn login(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((tag_no_case(b"LOGIN"), sp, astring, sp, astring)),
        |(_, _, username, _, password)| CommandBody::Login {
            username,
            password: Secret::new(password),
        },
    )(input)
}

/// `command-auth = select / examine / create / delete / rename /
///                 subscribe / unsubscribe / list / lsub / namespace /
///                 status / append / idle / getquota / getquotaroot /
///                 setquota`
///
/// Note: Valid only in Authenticated or Selected state.
fn command_auth(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((
        map(mailbox_arg(b"SELECT"), |mailbox| CommandBody::Select { mailbox }),
        map(mailbox_arg(b"EXAMINE"), |mailbox| CommandBody::Examine { mailbox }),
        map(mailbox_arg(b"CREATE"), |mailbox| CommandBody::Create { mailbox }),
        map(mailbox_arg(b"DELETE"), |mailbox| CommandBody::Delete { mailbox }),
        rename,
        map(mailbox_arg(b"SUBSCRIBE"), |mailbox| CommandBody::Subscribe { mailbox }),
        map(mailbox_arg(b"UNSUBSCRIBE"), |mailbox| {
            CommandBody::Unsubscribe { mailbox }
        }),
        list,
        lsub,
        value(CommandBody::Namespace, tag_no_case(b"NAMESPACE")),
        status,
        append,
        value(CommandBody::Idle, tag_no_case(b"IDLE")),
        getquotaroot,
        getquota,
        setquota,
    ))(input)
}

/// `rename = "RENAME" SP mailbox SP mailbox`
fn rename(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((tag_no_case(b"RENAME"), sp, mailbox, sp, mailbox)),
        |(_, _, from, _, to)| CommandBody::Rename { from, to },
    )(input)
}

/// `list = "LIST" SP mailbox SP list-mailbox`
fn list(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((tag_no_case(b"LIST"), sp, astring, sp, list_mailbox)),
        |(_, _, reference, _, pattern)| CommandBody::List { reference, pattern },
    )(input)
}

/// `lsub = "LSUB" SP mailbox SP list-mailbox`
fn lsub(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((tag_no_case(b"LSUB"), sp, astring, sp, list_mailbox)),
        |(_, _, reference, _, pattern)| CommandBody::Lsub { reference, pattern },
    )(input)
}

/// `status = "STATUS" SP mailbox SP "(" status-att *(SP status-att) ")"`
fn status(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((
            tag_no_case(b"STATUS"),
            sp,
            mailbox,
            sp,
            delimited(tag(b"("), separated_list1(sp, status_att), tag(b")")),
        )),
        |(_, _, mailbox, _, items)| CommandBody::Status { mailbox, items },
    )(input)
}

/// `status-att = "MESSAGES" / "UIDNEXT" / "UIDVALIDITY" / "UNSEEN" / "SIZE"`
fn status_att(input: &[u8]) -> IResult<&[u8], StatusItem> {
    alt((
        value(StatusItem::Messages, tag_no_case(b"MESSAGES")),
        value(StatusItem::UidNext, tag_no_case(b"UIDNEXT")),
        value(StatusItem::UidValidity, tag_no_case(b"UIDVALIDITY")),
        value(StatusItem::Unseen, tag_no_case(b"UNSEEN")),
        value(StatusItem::Size, tag_no_case(b"SIZE")),
    ))(input)
}

/// `append = "APPEND" SP mailbox [SP flag-list] [SP date-time] SP literal`
///
/// Only the literal marker is parsed here; the octets themselves bypass
/// the line framer.
fn append(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((
            tag_no_case(b"APPEND"),
            sp,
            mailbox,
            opt(preceded(sp, flag_list)),
            opt(preceded(sp, date_time)),
            sp,
            literal_marker,
        )),
        |(_, _, mailbox, flags, date, _, (size, non_sync))| CommandBody::Append {
            mailbox,
            flags: flags.unwrap_or_default(),
            date,
            size,
            non_sync,
        },
    )(input)
}

/// `literal = "{" number ["+"] "}"`
fn literal_marker(input: &[u8]) -> IResult<&[u8], (u64, bool)> {
    map(
        delimited(tag(b"{"), pair(number, opt(tag(b"+"))), tag(b"}")),
        |(size, plus)| (size, plus.is_some()),
    )(input)
}

/// `getquota = "GETQUOTA" SP astring`
fn getquota(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(pair(tag_no_case(b"GETQUOTA"), sp), astring),
        |root| CommandBody::GetQuota { root },
    )(input)
}

/// `getquotaroot = "GETQUOTAROOT" SP mailbox`
fn getquotaroot(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(pair(tag_no_case(b"GETQUOTAROOT"), sp), mailbox),
        |mailbox| CommandBody::GetQuotaRoot { mailbox },
    )(input)
}

/// `setquota = "SETQUOTA" SP astring SP "(" [setquota-resource
///              *(SP setquota-resource)] ")"`
fn setquota(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((
            tag_no_case(b"SETQUOTA"),
            sp,
            astring,
            sp,
            delimited(
                tag(b"("),
                separated_list0(sp, separated_pair(quota_resource, sp, number)),
                tag(b")"),
            ),
        )),
        |(_, _, root, _, limits)| CommandBody::SetQuota { root, limits },
    )(input)
}

fn quota_resource(input: &[u8]) -> IResult<&[u8], QuotaResource> {
    alt((
        value(QuotaResource::Storage, tag_no_case(b"STORAGE")),
        value(QuotaResource::Message, tag_no_case(b"MESSAGE")),
    ))(input)
}

/// `command-select = "CLOSE" / "UNSELECT" / "EXPUNGE" / search / fetch /
///                   store / copy / move / uid`
///
/// Note: Valid only when in Selected state.
fn command_select(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((
        value(CommandBody::Close, tag_no_case(b"CLOSE")),
        value(CommandBody::Unselect, tag_no_case(b"UNSELECT")),
        value(CommandBody::Expunge, tag_no_case(b"EXPUNGE")),
        search(false),
        fetch(false),
        store(false),
        copy(false),
        r#move(false),
        uid,
    ))(input)
}

/// `uid = "UID" SP (copy / fetch / search / store / move)`
fn uid(input: &[u8]) -> IResult<&[u8], CommandBody> {
    preceded(
        pair(tag_no_case(b"UID"), sp),
        alt((search(true), fetch(true), store(true), copy(true), r#move(true))),
    )(input)
}

/// `search = "SEARCH" [SP "CHARSET" SP charset] 1*(SP search-key)`
fn search(uid: bool) -> impl Fn(&[u8]) -> IResult<&[u8], CommandBody> {
    move |input| {
        map(
            tuple((
                tag_no_case(b"SEARCH"),
                opt(tuple((sp, tag_no_case(b"CHARSET"), sp, charset))),
                sp,
                separated_list1(sp, search_key),
            )),
            move |(_, _, _, mut keys)| CommandBody::Search {
                criteria: if keys.len() == 1 {
                    keys.remove(0)
                } else {
                    SearchKey::And(keys)
                },
                uid,
            },
        )(input)
    }
}

/// Only the charsets every server must know.
fn charset(input: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((tag_no_case(b"US-ASCII"), tag_no_case(b"UTF-8")))(input)
}

/// `search-key = "ALL" / "ANSWERED" / "BCC" SP astring / ... /
///               "(" search-key *(SP search-key) ")"`
fn search_key(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        search_key_flags,
        search_key_strings,
        search_key_dates,
        search_key_structure,
    ))(input)
}

fn search_key_flags(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        value(SearchKey::All, tag_no_case(b"ALL")),
        value(SearchKey::Answered, tag_no_case(b"ANSWERED")),
        value(SearchKey::Deleted, tag_no_case(b"DELETED")),
        value(SearchKey::Draft, tag_no_case(b"DRAFT")),
        value(SearchKey::Flagged, tag_no_case(b"FLAGGED")),
        value(SearchKey::New, tag_no_case(b"NEW")),
        value(SearchKey::Old, tag_no_case(b"OLD")),
        value(SearchKey::Recent, tag_no_case(b"RECENT")),
        value(SearchKey::Unanswered, tag_no_case(b"UNANSWERED")),
        value(SearchKey::Undeleted, tag_no_case(b"UNDELETED")),
        value(SearchKey::Undraft, tag_no_case(b"UNDRAFT")),
        value(SearchKey::Unflagged, tag_no_case(b"UNFLAGGED")),
        value(SearchKey::Unseen, tag_no_case(b"UNSEEN")),
        value(SearchKey::Seen, tag_no_case(b"SEEN")),
        map(
            preceded(pair(tag_no_case(b"UNKEYWORD"), sp), atom),
            SearchKey::Unkeyword,
        ),
        map(
            preceded(pair(tag_no_case(b"KEYWORD"), sp), atom),
            SearchKey::Keyword,
        ),
    ))(input)
}

fn search_key_strings(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        map(preceded(pair(tag_no_case(b"BCC"), sp), astring), SearchKey::Bcc),
        map(preceded(pair(tag_no_case(b"BODY"), sp), astring), SearchKey::Body),
        map(preceded(pair(tag_no_case(b"CC"), sp), astring), SearchKey::Cc),
        map(preceded(pair(tag_no_case(b"FROM"), sp), astring), SearchKey::From),
        map(
            tuple((tag_no_case(b"HEADER"), sp, astring, sp, astring)),
            |(_, _, field, _, needle)| SearchKey::Header(field, needle),
        ),
        map(
            preceded(pair(tag_no_case(b"LARGER"), sp), number_u32),
            SearchKey::Larger,
        ),
        map(
            preceded(pair(tag_no_case(b"SMALLER"), sp), number_u32),
            SearchKey::Smaller,
        ),
        map(
            preceded(pair(tag_no_case(b"SUBJECT"), sp), astring),
            SearchKey::Subject,
        ),
        map(preceded(pair(tag_no_case(b"TEXT"), sp), astring), SearchKey::Text),
        map(preceded(pair(tag_no_case(b"TO"), sp), astring), SearchKey::To),
    ))(input)
}

fn search_key_dates(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        map(
            preceded(pair(tag_no_case(b"BEFORE"), sp), date),
            SearchKey::Before,
        ),
        map(preceded(pair(tag_no_case(b"ON"), sp), date), SearchKey::On),
        map(
            preceded(pair(tag_no_case(b"SENTBEFORE"), sp), date),
            SearchKey::SentBefore,
        ),
        map(
            preceded(pair(tag_no_case(b"SENTON"), sp), date),
            SearchKey::SentOn,
        ),
        map(
            preceded(pair(tag_no_case(b"SENTSINCE"), sp), date),
            SearchKey::SentSince,
        ),
        map(
            preceded(pair(tag_no_case(b"SINCE"), sp), date),
            SearchKey::Since,
        ),
    ))(input)
}

fn search_key_structure(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        map(
            preceded(pair(tag_no_case(b"NOT"), sp), search_key),
            |key| SearchKey::Not(Box::new(key)),
        ),
        map(
            tuple((tag_no_case(b"OR"), sp, search_key, sp, search_key)),
            |(_, _, a, _, b)| SearchKey::Or(Box::new(a), Box::new(b)),
        ),
        map(
            preceded(pair(tag_no_case(b"UID"), sp), sequence_set),
            SearchKey::Uid,
        ),
        map(
            delimited(tag(b"("), separated_list1(sp, search_key), tag(b")")),
            |mut keys| {
                if keys.len() == 1 {
                    keys.remove(0)
                } else {
                    SearchKey::And(keys)
                }
            },
        ),
        map(sequence_set, SearchKey::SequenceSet),
    ))(input)
}

/// `fetch = "FETCH" SP sequence-set SP (fetch-att / "(" fetch-att
///           *(SP fetch-att) ")")`
fn fetch(uid: bool) -> impl Fn(&[u8]) -> IResult<&[u8], CommandBody> {
    move |input| {
        map(
            tuple((
                tag_no_case(b"FETCH"),
                sp,
                sequence_set,
                sp,
                alt((
                    delimited(tag(b"("), separated_list1(sp, fetch_att), tag(b")")),
                    map(fetch_att, |item| vec![item]),
                )),
            )),
            move |(_, _, set, _, items)| CommandBody::Fetch { set, items, uid },
        )(input)
    }
}

/// `fetch-att = "UID" / "FLAGS" / "RFC822.SIZE" / "INTERNALDATE" /
///              "BODY" section / "BODY.PEEK" section / "RFC822"`
///
/// Only the empty section (`BODY[]`, the whole message) is served.
fn fetch_att(input: &[u8]) -> IResult<&[u8], FetchItem> {
    alt((
        value(FetchItem::Uid, tag_no_case(b"UID")),
        value(FetchItem::Flags, tag_no_case(b"FLAGS")),
        value(FetchItem::Rfc822Size, tag_no_case(b"RFC822.SIZE")),
        value(FetchItem::InternalDate, tag_no_case(b"INTERNALDATE")),
        value(FetchItem::Body { peek: true }, tag_no_case(b"BODY.PEEK[]")),
        value(FetchItem::Body { peek: false }, tag_no_case(b"BODY[]")),
        value(FetchItem::Body { peek: false }, tag_no_case(b"RFC822")),
    ))(input)
}

/// `store = "STORE" SP sequence-set SP store-att-flags`
///
/// `store-att-flags = (["+" / "-"] "FLAGS" [".SILENT"]) SP
///                    (flag-list / (flag *(SP flag)))`
fn store(uid: bool) -> impl Fn(&[u8]) -> IResult<&[u8], CommandBody> {
    move |input| {
        map(
            tuple((
                tag_no_case(b"STORE"),
                sp,
                sequence_set,
                sp,
                opt(alt((
                    value(FlagOp::Add, tag(b"+")),
                    value(FlagOp::Remove, tag(b"-")),
                ))),
                tag_no_case(b"FLAGS"),
                opt(tag_no_case(b".SILENT")),
                sp,
                alt((flag_list, separated_list1(sp, flag))),
            )),
            move |(_, _, set, _, op, _, silent, _, flags)| CommandBody::Store {
                set,
                op: op.unwrap_or(FlagOp::Replace),
                silent: silent.is_some(),
                flags,
                uid,
            },
        )(input)
    }
}

/// `copy = "COPY" SP sequence-set SP mailbox`
fn copy(uid: bool) -> impl Fn(&[u8]) -> IResult<&[u8], CommandBody> {
    move |input| {
        map(
            tuple((tag_no_case(b"COPY"), sp, sequence_set, sp, mailbox)),
            move |(_, _, set, _, mailbox)| CommandBody::Copy { set, mailbox, uid },
        )(input)
    }
}

/// `move = "MOVE" SP sequence-set SP mailbox`
fn r#move(uid: bool) -> impl Fn(&[u8]) -> IResult<&[u8], CommandBody> {
    move |input| {
        map(
            tuple((tag_no_case(b"MOVE"), sp, sequence_set, sp, mailbox)),
            move |(_, _, set, _, mailbox)| CommandBody::Move { set, mailbox, uid },
        )(input)
    }
}

// --- Argument pieces -----------------------------------------------------

fn sp(input: &[u8]) -> IResult<&[u8], &[u8]> {
    tag(b" ")(input)
}

/// `<keyword> SP mailbox` — the shape SELECT, EXAMINE, CREATE, DELETE,
/// SUBSCRIBE, and UNSUBSCRIBE share.
fn mailbox_arg(keyword: &'static [u8]) -> impl Fn(&[u8]) -> IResult<&[u8], MailboxName> {
    move |input| preceded(pair(tag_no_case(keyword), sp), mailbox)(input)
}

/// `ATOM-CHAR = <any CHAR except atom-specials>`
fn is_atom_char(byte: u8) -> bool {
    matches!(byte, 0x21..=0x7e)
        && !matches!(byte, b'(' | b')' | b'{' | b'%' | b'*' | b'"' | b'\\' | b']')
}

/// `ASTRING-CHAR = ATOM-CHAR / resp-specials`
fn is_astring_char(byte: u8) -> bool {
    is_atom_char(byte) || byte == b']'
}

/// `list-char = ATOM-CHAR / list-wildcards / resp-specials`
fn is_list_char(byte: u8) -> bool {
    is_astring_char(byte) || byte == b'%' || byte == b'*'
}

fn is_base64_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'/' | b'=')
}

fn atom(input: &[u8]) -> IResult<&[u8], String> {
    map_res(take_while1(is_atom_char), |bytes: &[u8]| {
        from_utf8(bytes).map(ToOwned::to_owned)
    })(input)
}

/// `quoted = DQUOTE *QUOTED-CHAR DQUOTE`
///
/// Quoted strings are the one place the command line may carry UTF-8.
fn quoted(input: &[u8]) -> IResult<&[u8], String> {
    let (mut rest, _) = tag(b"\"")(input)?;
    let mut bytes = Vec::new();

    loop {
        match rest.first().copied() {
            Some(b'"') => {
                let text = String::from_utf8(bytes).map_err(|_| {
                    nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Char))
                })?;
                return Ok((&rest[1..], text));
            }
            Some(b'\\') => {
                match rest.get(1).copied() {
                    Some(escaped @ (b'"' | b'\\')) => bytes.push(escaped),
                    _ => {
                        return Err(nom::Err::Error(nom::error::Error::new(
                            input,
                            nom::error::ErrorKind::Escaped,
                        )))
                    }
                }
                rest = &rest[2..];
            }
            Some(b'\r' | b'\n') | None => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Char,
                )))
            }
            Some(byte) => {
                bytes.push(byte);
                rest = &rest[1..];
            }
        }
    }
}

/// `astring = 1*ASTRING-CHAR / string`
///
/// The quoted form may be empty (`""`).
fn astring(input: &[u8]) -> IResult<&[u8], String> {
    alt((
        quoted,
        map_res(take_while1(is_astring_char), |bytes: &[u8]| {
            from_utf8(bytes).map(ToOwned::to_owned)
        }),
    ))(input)
}

/// `mailbox = "INBOX" / astring`
fn mailbox(input: &[u8]) -> IResult<&[u8], MailboxName> {
    map(astring, |name| MailboxName::from_wire(&name))(input)
}

/// `list-mailbox = 1*list-char / string`
fn list_mailbox(input: &[u8]) -> IResult<&[u8], String> {
    alt((
        quoted,
        map_res(take_while1(is_list_char), |bytes: &[u8]| {
            from_utf8(bytes).map(ToOwned::to_owned)
        }),
    ))(input)
}

fn number(input: &[u8]) -> IResult<&[u8], u64> {
    map_res(digit1, |bytes: &[u8]| {
        from_utf8(bytes).map_err(|_| ()).and_then(|s| s.parse().map_err(|_| ()))
    })(input)
}

fn number_u32(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(digit1, |bytes: &[u8]| {
        from_utf8(bytes).map_err(|_| ()).and_then(|s| s.parse().map_err(|_| ()))
    })(input)
}

/// `flag = "\" atom / atom`
fn flag(input: &[u8]) -> IResult<&[u8], Flag> {
    map(
        pair(opt(tag(b"\\")), take_while1(is_atom_char)),
        |(backslash, name): (_, &[u8])| {
            let name = String::from_utf8_lossy(name);
            if backslash.is_some() {
                Flag::from_wire(&format!("\\{name}"))
            } else {
                Flag::from_wire(&name)
            }
        },
    )(input)
}

/// `flag-list = "(" [flag *(SP flag)] ")"`
fn flag_list(input: &[u8]) -> IResult<&[u8], Vec<Flag>> {
    delimited(tag(b"("), separated_list0(sp, flag), tag(b")"))(input)
}

/// `date-time = DQUOTE date-day-fixed "-" date-month "-" date-year SP
///              time SP zone DQUOTE`
fn date_time(input: &[u8]) -> IResult<&[u8], chrono::DateTime<chrono::FixedOffset>> {
    map_res(quoted, |text| parse_date_time(&text))(input)
}

/// `date = date-text / DQUOTE date-text DQUOTE`
fn date(input: &[u8]) -> IResult<&[u8], chrono::NaiveDate> {
    alt((
        map_res(quoted, |text| parse_date(&text)),
        map_res(take_while1(|b: u8| b.is_ascii_alphanumeric() || b == b'-'), |bytes: &[u8]| {
            from_utf8(bytes)
                .map_err(|_| crate::imap::datetime::DateTimeError(String::new()))
                .and_then(parse_date)
        }),
    ))(input)
}

fn sequence_set(input: &[u8]) -> IResult<&[u8], SequenceSet> {
    map_res(
        take_while1(|b: u8| b.is_ascii_digit() || matches!(b, b':' | b',' | b'*')),
        |bytes: &[u8]| {
            from_utf8(bytes)
                .map_err(|_| ())
                .and_then(|s| s.parse::<SequenceSet>().map_err(|_| ()))
        },
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Command {
        command(line.as_bytes()).unwrap()
    }

    #[test]
    fn test_any_state_commands() {
        assert_eq!(parse("a1 NOOP").body, CommandBody::Noop);
        assert_eq!(parse("a2 capability").body, CommandBody::Capability);
        assert_eq!(parse("a3 Logout").body, CommandBody::Logout);
        // Trailing whitespace is tolerated.
        assert_eq!(parse("a4 NOOP  ").body, CommandBody::Noop);
    }

    #[test]
    fn test_bad_tag_is_distinguished() {
        assert_eq!(command(b"* NOOP"), Err(CommandError::BadTag));
        assert_eq!(command(b"+ NOOP"), Err(CommandError::BadTag));
        assert_eq!(command(b"ta{g NOOP"), Err(CommandError::BadTag));
        assert_eq!(command(b""), Err(CommandError::BadTag));
    }

    #[test]
    fn test_unknown_command_keeps_tag() {
        match command(b"a1 FROBNICATE now") {
            Err(CommandError::Bad { tag, message }) => {
                assert_eq!(tag.as_str(), "a1");
                assert_eq!(message, "Unknown command");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_login() {
        let cmd = parse("a1 LOGIN alice \"s3cret pass\"");
        match cmd.body {
            CommandBody::Login { username, password } => {
                assert_eq!(username, "alice");
                assert_eq!(password.declassify(), "s3cret pass");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_authenticate_with_initial_response() {
        let cmd = parse("a1 AUTHENTICATE PLAIN AGFsaWNlAHMzY3JldA==");
        match cmd.body {
            CommandBody::Authenticate { mechanism, initial } => {
                assert_eq!(mechanism, Mechanism::Plain);
                assert_eq!(initial.unwrap(), b"\0alice\0s3cret");
            }
            other => panic!("unexpected: {other:?}"),
        }

        // `=` denotes a present-but-empty response.
        let cmd = parse("a2 AUTHENTICATE EXTERNAL =");
        match cmd.body {
            CommandBody::Authenticate { initial, .. } => assert_eq!(initial.unwrap(), b""),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_select_quoted_and_inbox() {
        assert_eq!(
            parse("a1 SELECT inbox").body,
            CommandBody::Select {
                mailbox: MailboxName::Inbox
            }
        );
        assert_eq!(
            parse("a2 SELECT \"My Folder\"").body,
            CommandBody::Select {
                mailbox: MailboxName::Other("My Folder".into())
            }
        );
    }

    #[test]
    fn test_append_with_all_options() {
        let cmd = parse("a1 APPEND INBOX (\\Seen gardening) \"17-Jul-1996 02:44:25 -0700\" {310}");
        match cmd.body {
            CommandBody::Append {
                mailbox,
                flags,
                date,
                size,
                non_sync,
            } => {
                assert_eq!(mailbox, MailboxName::Inbox);
                assert_eq!(flags, vec![Flag::Seen, Flag::Keyword("gardening".into())]);
                assert!(date.is_some());
                assert_eq!(size, 310);
                assert!(!non_sync);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_append_non_sync_literal() {
        match parse("a1 APPEND INBOX {12+}").body {
            CommandBody::Append { size, non_sync, .. } => {
                assert_eq!(size, 12);
                assert!(non_sync);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_append_rejects_malformed_date() {
        assert!(matches!(
            command(b"a1 APPEND INBOX \"yesterday\" {10}"),
            Err(CommandError::Bad { .. })
        ));
    }

    #[test]
    fn test_search_tree() {
        match parse("a1 SEARCH FLAGGED OR FROM carol SMALLER 5000 UNSEEN").body {
            CommandBody::Search { criteria, uid } => {
                assert!(!uid);
                assert_eq!(
                    criteria,
                    SearchKey::And(vec![
                        SearchKey::Flagged,
                        SearchKey::Or(
                            Box::new(SearchKey::From("carol".into())),
                            Box::new(SearchKey::Smaller(5000)),
                        ),
                        SearchKey::Unseen,
                    ])
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_uid_search_with_parens() {
        match parse("a1 UID SEARCH (DELETED SINCE 1-Feb-1994)").body {
            CommandBody::Search { criteria, uid } => {
                assert!(uid);
                match criteria {
                    SearchKey::And(keys) => {
                        assert_eq!(keys[0], SearchKey::Deleted);
                        assert!(matches!(keys[1], SearchKey::Since(_)));
                    }
                    other => panic!("unexpected: {other:?}"),
                }
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_fetch_items() {
        match parse("a1 FETCH 1:4,7 (FLAGS UID RFC822.SIZE)").body {
            CommandBody::Fetch { set, items, uid } => {
                assert!(!uid);
                assert_eq!(set.expand(10), vec![1, 2, 3, 4, 7]);
                assert_eq!(
                    items,
                    vec![FetchItem::Flags, FetchItem::Uid, FetchItem::Rfc822Size]
                );
            }
            other => panic!("unexpected: {other:?}"),
        }

        match parse("a2 UID FETCH 1:* BODY[]").body {
            CommandBody::Fetch { items, uid, .. } => {
                assert!(uid);
                assert_eq!(items, vec![FetchItem::Body { peek: false }]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_store_variants() {
        match parse("a1 STORE 2 +FLAGS (\\Deleted)").body {
            CommandBody::Store { op, silent, flags, .. } => {
                assert_eq!(op, FlagOp::Add);
                assert!(!silent);
                assert_eq!(flags, vec![Flag::Deleted]);
            }
            other => panic!("unexpected: {other:?}"),
        }

        match parse("a2 STORE 1:3 -FLAGS.SILENT \\Seen").body {
            CommandBody::Store { op, silent, flags, .. } => {
                assert_eq!(op, FlagOp::Remove);
                assert!(silent);
                assert_eq!(flags, vec![Flag::Seen]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_quota_commands() {
        assert_eq!(
            parse("a1 GETQUOTA \"\"").body,
            CommandBody::GetQuota { root: "".into() }
        );
        assert_eq!(
            parse("a2 GETQUOTAROOT INBOX").body,
            CommandBody::GetQuotaRoot {
                mailbox: MailboxName::Inbox
            }
        );
        assert_eq!(
            parse("a3 SETQUOTA alice (STORAGE 512 MESSAGE 1000)").body,
            CommandBody::SetQuota {
                root: "alice".into(),
                limits: vec![
                    (QuotaResource::Storage, 512),
                    (QuotaResource::Message, 1000)
                ],
            }
        );
    }

    #[test]
    fn test_list_patterns() {
        assert_eq!(
            parse("a1 LIST \"\" *").body,
            CommandBody::List {
                reference: "".into(),
                pattern: "*".into()
            }
        );
        assert_eq!(
            parse("a2 LIST \"\" \"%\"").body,
            CommandBody::List {
                reference: "".into(),
                pattern: "%".into()
            }
        );
    }

    #[test]
    fn test_move_and_copy() {
        assert_eq!(
            parse("a1 COPY 1:3 Archive").body,
            CommandBody::Copy {
                set: "1:3".parse().unwrap(),
                mailbox: MailboxName::Other("Archive".into()),
                uid: false,
            }
        );
        assert_eq!(
            parse("a2 UID MOVE 40:44 Trash").body,
            CommandBody::Move {
                set: "40:44".parse().unwrap(),
                mailbox: MailboxName::Other("Trash".into()),
                uid: true,
            }
        );
    }
}
