//! POP3 command parsing.
//!
//! `command = keyword *(SP argument) CRLF` — no tags, US-ASCII only,
//! 512 octets per line including CRLF (RFC 1939, RFC 2449).

use std::str::from_utf8;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::digit1,
    combinator::{all_consuming, map, map_res, opt, value},
    sequence::{pair, preceded, tuple},
    IResult,
};
use thiserror::Error;

use crate::{sasl::Mechanism, secret::Secret};

/// A parsed POP3 command.
#[derive(Debug, Clone, PartialEq)]
pub enum Pop3Command {
    Quit,
    Capa,
    Noop,

    // AUTHORIZATION state.
    User(String),
    Pass(Secret<String>),
    Apop { user: String, digest: String },
    Auth {
        /// `AUTH` without a mechanism asks for the mechanism list.
        mechanism: Option<Mechanism>,
        initial: Option<Vec<u8>>,
    },
    Stls,
    Utf8,

    // TRANSACTION state.
    Stat,
    List(Option<u32>),
    Retr(u32),
    Dele(u32),
    Rset,
    Top(u32, u32),
    Uidl(Option<u32>),
}

impl Pop3Command {
    /// The keyword, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Pop3Command::Quit => "QUIT",
            Pop3Command::Capa => "CAPA",
            Pop3Command::Noop => "NOOP",
            Pop3Command::User(_) => "USER",
            Pop3Command::Pass(_) => "PASS",
            Pop3Command::Apop { .. } => "APOP",
            Pop3Command::Auth { .. } => "AUTH",
            Pop3Command::Stls => "STLS",
            Pop3Command::Utf8 => "UTF8",
            Pop3Command::Stat => "STAT",
            Pop3Command::List(_) => "LIST",
            Pop3Command::Retr(_) => "RETR",
            Pop3Command::Dele(_) => "DELE",
            Pop3Command::Rset => "RSET",
            Pop3Command::Top(_, _) => "TOP",
            Pop3Command::Uidl(_) => "UIDL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Pop3ParseError {
    #[error("unknown command")]
    UnknownCommand,

    #[error("syntax error in arguments")]
    BadArguments,
}

/// Parse one framed command line (CRLF already stripped).
pub fn command(line: &[u8]) -> Result<Pop3Command, Pop3ParseError> {
    // Permissive about trailing whitespace.
    let mut line = line;
    while line.last() == Some(&b' ') {
        line = &line[..line.len() - 1];
    }

    match all_consuming(pop3_command)(line) {
        Ok((_, command)) => Ok(command),
        Err(_) => {
            let keyword = line
                .split(|b| *b == b' ')
                .next()
                .and_then(|word| from_utf8(word).ok())
                .unwrap_or_default()
                .to_ascii_uppercase();

            const KNOWN: &[&str] = &[
                "QUIT", "CAPA", "NOOP", "USER", "PASS", "APOP", "AUTH", "STLS", "UTF8", "STAT",
                "LIST", "RETR", "DELE", "RSET", "TOP", "UIDL",
            ];

            if KNOWN.contains(&keyword.as_str()) {
                Err(Pop3ParseError::BadArguments)
            } else {
                Err(Pop3ParseError::UnknownCommand)
            }
        }
    }
}

/// Parses any command.
fn pop3_command(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    alt((
        user, pass, apop, auth, stls, utf8, // AUTHORIZATION
        capa, quit, noop, // any state
        stat, list, retr, dele, rset, top, uidl, // TRANSACTION
    ))(input)
}

/// `user = "USER" SP name`
fn user(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    map(preceded(pair(tag_no_case(b"USER"), sp), rest_string), Pop3Command::User)(input)
}

/// `pass = "PASS" SP string` — the password may contain spaces.
fn pass(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    map(preceded(pair(tag_no_case(b"PASS"), sp), rest_string), |password| {
        Pop3Command::Pass(Secret::new(password))
    })(input)
}

/// `apop = "APOP" SP name SP digest`
fn apop(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    map(
        tuple((tag_no_case(b"APOP"), sp, token, sp, token)),
        |(_, _, user, _, digest)| Pop3Command::Apop { user, digest },
    )(input)
}

/// `auth = "AUTH" [SP mechanism [SP initial-response]]` (RFC 5034)
fn auth(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    map(
        tuple((
            tag_no_case(b"AUTH"),
            opt(preceded(sp, mechanism)),
            opt(preceded(sp, initial_response)),
        )),
        |(_, mechanism, initial)| Pop3Command::Auth { mechanism, initial },
    )(input)
}

fn mechanism(input: &[u8]) -> IResult<&[u8], Mechanism> {
    map_res(token, |name| name.parse::<Mechanism>())(input)
}

fn initial_response(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    alt((
        value(Vec::new(), tag(b"=")),
        map_res(
            take_while1(|b: u8| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=')),
            |bytes: &[u8]| BASE64.decode(bytes),
        ),
    ))(input)
}

fn stls(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    value(Pop3Command::Stls, tag_no_case(b"STLS"))(input)
}

fn utf8(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    value(Pop3Command::Utf8, tag_no_case(b"UTF8"))(input)
}

fn capa(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    value(Pop3Command::Capa, tag_no_case(b"CAPA"))(input)
}

fn quit(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    value(Pop3Command::Quit, tag_no_case(b"QUIT"))(input)
}

fn noop(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    value(Pop3Command::Noop, tag_no_case(b"NOOP"))(input)
}

fn stat(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    value(Pop3Command::Stat, tag_no_case(b"STAT"))(input)
}

/// `list = "LIST" [SP msg-number]`
fn list(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    map(
        preceded(tag_no_case(b"LIST"), opt(preceded(sp, number))),
        Pop3Command::List,
    )(input)
}

/// `retr = "RETR" SP msg-number`
fn retr(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    map(preceded(pair(tag_no_case(b"RETR"), sp), number), Pop3Command::Retr)(input)
}

/// `dele = "DELE" SP msg-number`
fn dele(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    map(preceded(pair(tag_no_case(b"DELE"), sp), number), Pop3Command::Dele)(input)
}

fn rset(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    value(Pop3Command::Rset, tag_no_case(b"RSET"))(input)
}

/// `top = "TOP" SP msg-number SP line-count`
fn top(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    map(
        tuple((tag_no_case(b"TOP"), sp, number, sp, number)),
        |(_, _, msg, _, lines)| Pop3Command::Top(msg, lines),
    )(input)
}

/// `uidl = "UIDL" [SP msg-number]`
fn uidl(input: &[u8]) -> IResult<&[u8], Pop3Command> {
    map(
        preceded(tag_no_case(b"UIDL"), opt(preceded(sp, number))),
        Pop3Command::Uidl,
    )(input)
}

fn sp(input: &[u8]) -> IResult<&[u8], &[u8]> {
    tag(b" ")(input)
}

/// One printable-ASCII word.
fn token(input: &[u8]) -> IResult<&[u8], String> {
    map_res(
        take_while1(|b: u8| (0x21..=0x7e).contains(&b)),
        |bytes: &[u8]| from_utf8(bytes).map(ToOwned::to_owned),
    )(input)
}

/// Everything up to the end of the line.
fn rest_string(input: &[u8]) -> IResult<&[u8], String> {
    map_res(
        take_while1(|b: u8| b != b'\r' && b != b'\n'),
        |bytes: &[u8]| from_utf8(bytes).map(ToOwned::to_owned),
    )(input)
}

fn number(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(digit1, |bytes: &[u8]| {
        from_utf8(bytes)
            .map_err(|_| ())
            .and_then(|s| s.parse().map_err(|_| ()))
    })(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_commands() {
        assert_eq!(command(b"QUIT").unwrap(), Pop3Command::Quit);
        assert_eq!(command(b"noop").unwrap(), Pop3Command::Noop);
        assert_eq!(command(b"Stat").unwrap(), Pop3Command::Stat);
        assert_eq!(command(b"CAPA ").unwrap(), Pop3Command::Capa);
    }

    #[test]
    fn test_user_pass() {
        assert_eq!(command(b"USER bob").unwrap(), Pop3Command::User("bob".into()));
        match command(b"PASS secret with spaces").unwrap() {
            Pop3Command::Pass(password) => {
                assert_eq!(password.declassify(), "secret with spaces")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_apop() {
        assert_eq!(
            command(b"APOP mrose c4c9334bac560ecc979e58001b3e22fb").unwrap(),
            Pop3Command::Apop {
                user: "mrose".into(),
                digest: "c4c9334bac560ecc979e58001b3e22fb".into(),
            }
        );
    }

    #[test]
    fn test_auth_variants() {
        assert_eq!(
            command(b"AUTH").unwrap(),
            Pop3Command::Auth {
                mechanism: None,
                initial: None
            }
        );
        assert_eq!(
            command(b"AUTH PLAIN").unwrap(),
            Pop3Command::Auth {
                mechanism: Some(Mechanism::Plain),
                initial: None
            }
        );
        match command(b"AUTH PLAIN AGFsaWNlAHMzY3JldA==").unwrap() {
            Pop3Command::Auth {
                mechanism: Some(Mechanism::Plain),
                initial: Some(initial),
            } => assert_eq!(initial, b"\0alice\0s3cret"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_numeric_arguments() {
        assert_eq!(command(b"LIST").unwrap(), Pop3Command::List(None));
        assert_eq!(command(b"LIST 2").unwrap(), Pop3Command::List(Some(2)));
        assert_eq!(command(b"RETR 1").unwrap(), Pop3Command::Retr(1));
        assert_eq!(command(b"DELE 3").unwrap(), Pop3Command::Dele(3));
        assert_eq!(command(b"TOP 2 10").unwrap(), Pop3Command::Top(2, 10));
        assert_eq!(command(b"UIDL").unwrap(), Pop3Command::Uidl(None));
    }

    #[test]
    fn test_errors() {
        assert_eq!(command(b"FROBNICATE"), Err(Pop3ParseError::UnknownCommand));
        assert_eq!(command(b"RETR"), Err(Pop3ParseError::BadArguments));
        assert_eq!(command(b"RETR x"), Err(Pop3ParseError::BadArguments));
        assert_eq!(command(b"TOP 1"), Err(Pop3ParseError::BadArguments));
    }
}
