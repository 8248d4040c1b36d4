//! The POP3 protocol engine.
//!
//! One [`Pop3Session`] owns one connection and walks the three-state
//! machine: AUTHORIZATION until credentials are accepted, TRANSACTION
//! while the maildrop is open, UPDATE once QUIT commits the deletion
//! marks. Marks live with the session, never with the store: a session
//! that ends without QUIT leaves the maildrop untouched.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use log::{debug, info, warn};

use crate::{
    config::Pop3Config,
    endpoint::Endpoint,
    error::FatalError,
    framer::LineFramer,
    realm::{Lookup, Realm},
    sasl::{ChannelView, Mechanism, SaslFailure, SaslOutcome, SaslSession},
    secret::Secret,
    store::{MailStore, Mailbox, MessageMeta, UserStore},
};

pub mod command;
pub mod response;

use command::{Pop3Command, Pop3ParseError};
use response::{write_multi_line, write_rows, Reply};

/// RFC 1939 limits request lines to 512 octets including CRLF.
const MAX_LINE_LENGTH: usize = 512;

/// State of a POP3 connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pop3State {
    /// Greeting sent; waiting for credentials.
    Authorization,
    /// Maildrop open; LIST/RETR/DELE permitted.
    Transaction,
    /// QUIT received in TRANSACTION; deletions committed, connection
    /// closing. No further commands are served.
    Update,
}

/// Per-listener collaborators shared by all of its connections.
pub struct Pop3Context {
    pub config: Pop3Config,
    pub realm: Arc<dyn Realm>,
    pub store: Arc<dyn MailStore>,
    /// Whether a TLS server context is configured; gates STLS.
    pub tls_available: bool,
}

/// The session's snapshot of the maildrop, with its deletion marks.
struct Maildrop {
    mailbox: Box<dyn Mailbox>,
    /// Message list at login time; POP3 numbering is 1-based into this.
    messages: Vec<MessageMeta>,
    /// In-memory deletion marks, applied to the store only on QUIT.
    deleted: BTreeSet<u32>,
}

impl Maildrop {
    /// Messages not hidden by a deletion mark.
    fn visible(&self) -> impl Iterator<Item = (u32, &MessageMeta)> {
        self.messages
            .iter()
            .enumerate()
            .map(|(i, meta)| (i as u32 + 1, meta))
            .filter(|(n, _)| !self.deleted.contains(n))
    }

    /// Look a visible message up by its POP3 number.
    fn get(&self, number: u32) -> Option<&MessageMeta> {
        if number == 0 || self.deleted.contains(&number) {
            return None;
        }
        self.messages.get(number as usize - 1)
    }
}

/// One POP3 connection.
pub struct Pop3Session<E: Endpoint> {
    ctx: Arc<Pop3Context>,
    endpoint: E,
    framer: LineFramer,
    state: Pop3State,
    /// APOP challenge embedded in the greeting banner.
    apop_timestamp: Option<String>,
    pending_user: Option<String>,
    principal: Option<String>,
    user_store: Option<Box<dyn UserStore>>,
    maildrop: Option<Maildrop>,
    sasl: Option<SaslSession>,
    auth_failures: u32,
    /// Login delay the driver must observe before flushing (RFC 2449).
    pending_delay: Option<Duration>,
    utf8: bool,
    greeted: bool,
}

impl<E: Endpoint> Pop3Session<E> {
    pub fn new(ctx: Arc<Pop3Context>, endpoint: E) -> Self {
        Self {
            ctx,
            endpoint,
            framer: LineFramer::new(MAX_LINE_LENGTH),
            state: Pop3State::Authorization,
            apop_timestamp: None,
            pending_user: None,
            principal: None,
            user_store: None,
            maildrop: None,
            sasl: None,
            auth_failures: 0,
            pending_delay: None,
            utf8: false,
            greeted: false,
        }
    }

    pub fn endpoint_mut(&mut self) -> &mut E {
        &mut self.endpoint
    }

    /// Send the greeting banner. With APOP enabled it carries the
    /// `<pid.epoch_ms@host>` challenge timestamp.
    pub fn greet(&mut self) {
        if self.greeted {
            return;
        }
        self.greeted = true;

        let host = self.ctx.config.host_name.clone();
        if self.ctx.config.enable_apop {
            let epoch_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            let timestamp = format!("<{}.{}@{}>", std::process::id(), epoch_ms, host);
            self.reply(Reply::ok(format!("{host} POP3 server ready {timestamp}")));
            self.apop_timestamp = Some(timestamp);
        } else {
            self.reply(Reply::ok(format!("{host} POP3 server ready")));
        }
    }

    /// The driver reports a completed TLS handshake.
    pub fn security_established(&mut self) {
        debug!("POP3 connection to {} is now secure", self.endpoint.peer_addr());
    }

    /// A login delay to observe before flushing output, if one is due.
    pub fn take_delay(&mut self) -> Option<Duration> {
        self.pending_delay.take()
    }

    /// Inactivity timer fired.
    pub fn timed_out(&mut self) {
        self.reply(Reply::err("Autologout; idle for too long"));
        self.endpoint.close();
    }

    /// Server is shutting down.
    pub fn shutdown(&mut self) {
        self.reply(Reply::err("Server shutting down"));
        self.endpoint.close();
    }

    pub fn applicable_timeout(&self) -> Duration {
        self.ctx.config.transaction_timeout
    }

    /// Feed received bytes in; responses accumulate on the endpoint.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<(), FatalError> {
        self.framer.extend(bytes);

        loop {
            match self.framer.next_line() {
                Ok(Some(line)) => self.handle_line(&line),
                Ok(None) => return Ok(()),
                Err(fatal) => {
                    self.reply(Reply::err(format!("Fatal protocol error: {fatal}")));
                    self.endpoint.close();
                    return Err(fatal);
                }
            }
        }
    }

    fn handle_line(&mut self, line: &Bytes) {
        if self.state == Pop3State::Update {
            self.reply(Reply::err("Session already closing"));
            return;
        }

        // Command lines are US-ASCII unless UTF8 has been negotiated.
        if !self.utf8 && line.iter().any(|b| *b >= 0x80) {
            self.reply(Reply::err("Non-ASCII input"));
            return;
        }

        // A SASL exchange interprets lines as continuations, not commands.
        if let Some(mut session) = self.sasl.take() {
            if line.as_ref() == b"*" {
                self.reply(Reply::err("Authentication cancelled"));
                return;
            }
            let data = match BASE64.decode(line.as_ref()) {
                Ok(data) => data,
                Err(_) => {
                    self.note_auth_failure();
                    self.reply(Reply::err("Invalid base64 continuation"));
                    return;
                }
            };
            let outcome = session.respond(&data, self.ctx.realm.as_ref(), &self.channel_view());
            self.conclude_sasl(session, outcome);
            return;
        }

        match command::command(line.as_ref()) {
            Ok(command) => self.dispatch(command),
            Err(Pop3ParseError::UnknownCommand) => {
                self.reply(Reply::err("Unknown command"));
            }
            Err(Pop3ParseError::BadArguments) => {
                self.reply(Reply::err("Syntax error in arguments"));
            }
        }
    }

    fn dispatch(&mut self, command: Pop3Command) {
        use Pop3State::*;

        let permitted = match &command {
            Pop3Command::Quit | Pop3Command::Capa | Pop3Command::Noop => {
                self.state != Update
            }
            Pop3Command::User(_)
            | Pop3Command::Pass(_)
            | Pop3Command::Apop { .. }
            | Pop3Command::Auth { .. }
            | Pop3Command::Stls
            | Pop3Command::Utf8 => self.state == Authorization,
            _ => self.state == Transaction,
        };
        if !permitted {
            self.reply(Reply::err(format!(
                "{} not permitted in this state",
                command.name()
            )));
            return;
        }

        match command {
            Pop3Command::Quit => self.cmd_quit(),
            Pop3Command::Capa => self.cmd_capa(),
            Pop3Command::Noop => self.reply(Reply::ok("")),
            Pop3Command::User(user) => self.cmd_user(user),
            Pop3Command::Pass(password) => self.cmd_pass(password),
            Pop3Command::Apop { user, digest } => self.cmd_apop(user, digest),
            Pop3Command::Auth { mechanism, initial } => self.cmd_auth(mechanism, initial),
            Pop3Command::Stls => self.cmd_stls(),
            Pop3Command::Utf8 => self.cmd_utf8(),
            Pop3Command::Stat => self.cmd_stat(),
            Pop3Command::List(number) => self.cmd_list(number),
            Pop3Command::Retr(number) => self.cmd_retr(number),
            Pop3Command::Dele(number) => self.cmd_dele(number),
            Pop3Command::Rset => self.cmd_rset(),
            Pop3Command::Top(number, lines) => self.cmd_top(number, lines),
            Pop3Command::Uidl(number) => self.cmd_uidl(number),
        }
    }

    // --- Any state -------------------------------------------------------

    fn cmd_quit(&mut self) {
        if self.state == Pop3State::Transaction {
            self.state = Pop3State::Update;
            match self.commit_deletions() {
                Ok(()) => self.reply(Reply::ok("Bye")),
                Err(reason) => self.reply(Reply::err(reason)),
            }
        } else {
            self.reply(Reply::ok("Bye"));
        }
        self.endpoint.close();
    }

    /// Apply the session's deletion marks to the store, exactly once.
    fn commit_deletions(&mut self) -> Result<(), String> {
        let Some(mut maildrop) = self.maildrop.take() else {
            return Ok(());
        };

        for number in &maildrop.deleted {
            let Some(meta) = maildrop.messages.get(*number as usize - 1) else {
                continue;
            };
            if let Err(error) = maildrop.mailbox.delete_message(meta.sequence) {
                warn!("QUIT: marking message {number} failed: {error}");
                let _ = maildrop.mailbox.close(false);
                return Err("Some messages were not removed".into());
            }
        }

        if let Err(error) = maildrop.mailbox.close(true) {
            warn!("QUIT: expunge failed: {error}");
            return Err("Some messages were not removed".into());
        }
        if let Some(mut user_store) = self.user_store.take() {
            user_store.close();
        }

        Ok(())
    }

    fn cmd_capa(&mut self) {
        let config = &self.ctx.config;
        let secure = self.endpoint.is_secure();
        let mut rows: Vec<String> = vec!["TOP".into(), "UIDL".into(), "RESP-CODES".into()];

        if config.enable_pipelining {
            rows.push("PIPELINING".into());
        }
        if secure || config.allow_plaintext {
            rows.push("USER".into());
        }
        let mechanisms: Vec<String> = self
            .ctx
            .realm
            .sasl_mechanisms()
            .into_iter()
            .filter(|m| secure || !m.requires_tls(config.allow_plaintext))
            .map(|m| m.to_string())
            .collect();
        if !mechanisms.is_empty() {
            rows.push(format!("SASL {}", mechanisms.join(" ")));
        }
        if !secure && self.ctx.tls_available {
            rows.push("STLS".into());
        }
        if config.enable_utf8 {
            rows.push("UTF8".into());
        }
        rows.push(format!("LOGIN-DELAY {}", config.login_delay.as_secs()));
        rows.push("IMPLEMENTATION mailgate".into());

        let mut out = Reply::ok("Capability list follows").serialize();
        write_rows(&mut out, &rows);
        self.endpoint.send(&out);
    }

    // --- AUTHORIZATION ---------------------------------------------------

    fn cmd_user(&mut self, user: String) {
        if !self.endpoint.is_secure() && !self.ctx.config.allow_plaintext {
            self.reply(Reply::err("Plaintext authentication disabled; use STLS or APOP"));
            return;
        }
        self.pending_user = Some(user);
        self.reply(Reply::ok("Send PASS"));
    }

    fn cmd_pass(&mut self, password: Secret<String>) {
        let Some(user) = self.pending_user.take() else {
            self.reply(Reply::err("USER first"));
            return;
        };

        match self.ctx.realm.password_match(&user, password.declassify()) {
            Ok(true) => self.open_maildrop(user),
            Ok(false) => {
                self.note_auth_failure();
                warn!("POP3 login failed for {user}");
                self.reply(Reply::err("Bad credentials"));
            }
            Err(error) => {
                warn!("PASS: realm failure for {user}: {error}");
                self.reply(Reply::err("Internal error"));
            }
        }
    }

    fn cmd_apop(&mut self, user: String, digest: String) {
        if !self.ctx.config.enable_apop {
            self.reply(Reply::err("APOP is not enabled"));
            return;
        }
        let Some(timestamp) = self.apop_timestamp.clone() else {
            self.reply(Reply::err("APOP is not available"));
            return;
        };

        match self.ctx.realm.apop_response(&user, &timestamp) {
            Ok(Lookup::Found(expected)) if expected.eq_ignore_ascii_case(&digest) => {
                self.open_maildrop(user);
            }
            Ok(Lookup::Found(_) | Lookup::NoSuchUser) => {
                self.note_auth_failure();
                warn!("APOP failed for {user}");
                self.reply(Reply::err("Bad credentials"));
            }
            Ok(Lookup::Unsupported) => {
                self.reply(Reply::err("APOP is not supported for this user"));
            }
            Err(error) => {
                warn!("APOP: realm failure for {user}: {error}");
                self.reply(Reply::err("Internal error"));
            }
        }
    }

    fn cmd_auth(&mut self, mechanism: Option<Mechanism>, initial: Option<Vec<u8>>) {
        let Some(mechanism) = mechanism else {
            // Bare AUTH asks for the mechanism list (RFC 5034).
            let rows: Vec<String> = self
                .ctx
                .realm
                .sasl_mechanisms()
                .into_iter()
                .map(|m| m.to_string())
                .collect();
            let mut out = Reply::ok("SASL mechanisms supported").serialize();
            write_rows(&mut out, &rows);
            self.endpoint.send(&out);
            return;
        };

        let (session, outcome) = SaslSession::start(
            mechanism,
            initial.as_deref(),
            self.ctx.realm.as_ref(),
            &self.channel_view(),
            &self.ctx.config.host_name,
        );

        self.conclude_sasl(session, outcome);
    }

    fn conclude_sasl(&mut self, session: SaslSession, outcome: SaslOutcome) {
        match outcome {
            SaslOutcome::Proceed(payload) => {
                self.reply_raw(format!("+ {}\r\n", BASE64.encode(payload)));
                self.sasl = Some(session);
            }
            SaslOutcome::Success(authenticated) => {
                self.open_maildrop(authenticated.principal);
            }
            SaslOutcome::Failure(failure) => {
                warn!("POP3 AUTH failed: {failure}");
                match failure {
                    SaslFailure::BadCredentials => {
                        self.note_auth_failure();
                        self.reply(Reply::err("[AUTH] Bad credentials"));
                    }
                    SaslFailure::PrivacyRequired(mechanism) => {
                        self.reply(Reply::err(format!(
                            "Encryption required for {mechanism}"
                        )));
                    }
                    other => self.reply(Reply::err(other.to_string())),
                }
            }
        }
    }

    fn cmd_stls(&mut self) {
        if self.endpoint.is_secure() {
            self.reply(Reply::err("Already using TLS"));
            return;
        }
        if !self.ctx.tls_available {
            self.reply(Reply::err("TLS is not available"));
            return;
        }

        self.reply(Reply::ok("Begin TLS negotiation"));
        self.endpoint.start_tls();
    }

    fn cmd_utf8(&mut self) {
        if !self.ctx.config.enable_utf8 {
            self.reply(Reply::err("UTF8 is not enabled"));
            return;
        }
        self.utf8 = true;
        self.reply(Reply::ok("UTF8 enabled"));
    }

    fn open_maildrop(&mut self, user: String) {
        let opened = self.ctx.store.open(&user).and_then(|mut user_store| {
            let mailbox = user_store.open_mailbox("INBOX", false)?;
            let messages = mailbox.get_message_list()?;
            Ok((user_store, mailbox, messages))
        });

        match opened {
            Ok((user_store, mailbox, messages)) => {
                info!("{user} entered TRANSACTION state");
                let count = messages.len();
                self.user_store = Some(user_store);
                self.maildrop = Some(Maildrop {
                    mailbox,
                    messages,
                    deleted: BTreeSet::new(),
                });
                self.principal = Some(user);
                self.state = Pop3State::Transaction;
                self.auth_failures = 0;
                self.reply(Reply::ok(format!("Maildrop has {count} messages")));
            }
            Err(error) => {
                warn!("maildrop open failed for {user}: {error}");
                self.reply(Reply::err("[SYS/TEMP] Maildrop unavailable"));
            }
        }
    }

    fn note_auth_failure(&mut self) {
        self.auth_failures += 1;
        if self.auth_failures >= self.ctx.config.max_auth_failures {
            self.pending_delay = Some(self.ctx.config.login_delay);
        }
    }

    // --- TRANSACTION -----------------------------------------------------

    fn cmd_stat(&mut self) {
        let Some(maildrop) = self.maildrop.as_ref() else {
            self.reply(Reply::err("Internal error"));
            return;
        };
        let count = maildrop.visible().count();
        let octets: u64 = maildrop.visible().map(|(_, meta)| meta.size).sum();
        self.reply(Reply::ok(format!("{count} {octets}")));
    }

    fn cmd_list(&mut self, number: Option<u32>) {
        let Some(maildrop) = self.maildrop.as_ref() else {
            self.reply(Reply::err("Internal error"));
            return;
        };

        match number {
            Some(number) => match maildrop.get(number) {
                Some(meta) => {
                    let size = meta.size;
                    self.reply(Reply::ok(format!("{number} {size}")));
                }
                None => self.reply(Reply::err("No such message")),
            },
            None => {
                let rows: Vec<String> = maildrop
                    .visible()
                    .map(|(n, meta)| format!("{n} {}", meta.size))
                    .collect();
                let count = rows.len();
                let mut out = Reply::ok(format!("{count} messages")).serialize();
                write_rows(&mut out, &rows);
                self.endpoint.send(&out);
            }
        }
    }

    fn cmd_uidl(&mut self, number: Option<u32>) {
        let result: Result<Vec<u8>, String> = (|| {
            let maildrop = self.maildrop.as_ref().ok_or("Internal error".to_owned())?;

            match number {
                Some(number) => {
                    let meta = maildrop.get(number).ok_or("No such message".to_owned())?;
                    let uid = maildrop
                        .mailbox
                        .get_unique_id(meta.sequence)
                        .map_err(|error| error.to_string())?;
                    Ok(Reply::ok(format!("{number} {uid}")).serialize())
                }
                None => {
                    let mut rows = Vec::new();
                    for (n, meta) in maildrop.visible() {
                        let uid = maildrop
                            .mailbox
                            .get_unique_id(meta.sequence)
                            .map_err(|error| error.to_string())?;
                        rows.push(format!("{n} {uid}"));
                    }
                    let mut out = Reply::ok("").serialize();
                    write_rows(&mut out, &rows);
                    Ok(out)
                }
            }
        })();

        match result {
            Ok(bytes) => self.endpoint.send(&bytes),
            Err(reason) => self.reply(Reply::err(reason)),
        }
    }

    fn cmd_retr(&mut self, number: u32) {
        self.send_message(number, None);
    }

    fn cmd_top(&mut self, number: u32, lines: u32) {
        self.send_message(number, Some(lines));
    }

    /// RETR and TOP share the read-stuff-terminate path.
    fn send_message(&mut self, number: u32, top_lines: Option<u32>) {
        let result: Result<Vec<u8>, String> = (|| {
            let maildrop = self.maildrop.as_ref().ok_or("Internal error".to_owned())?;
            let meta = maildrop.get(number).ok_or("No such message".to_owned())?;

            let mut reader = match top_lines {
                Some(lines) => maildrop
                    .mailbox
                    .get_message_top(meta.sequence, lines)
                    .map_err(|error| error.to_string())?,
                None => maildrop
                    .mailbox
                    .get_message_content(meta.sequence)
                    .map_err(|error| error.to_string())?,
            };

            let mut content = Vec::new();
            std::io::Read::read_to_end(&mut reader, &mut content)
                .map_err(|error| error.to_string())?;

            let mut out = Reply::ok(format!("{} octets", meta.size)).serialize();
            write_multi_line(&mut out, &content);
            Ok(out)
        })();

        match result {
            Ok(bytes) => self.endpoint.send(&bytes),
            Err(reason) => self.reply(Reply::err(reason)),
        }
    }

    fn cmd_dele(&mut self, number: u32) {
        let Some(maildrop) = self.maildrop.as_mut() else {
            self.reply(Reply::err("Internal error"));
            return;
        };

        if maildrop.get(number).is_none() {
            self.reply(Reply::err("No such message"));
            return;
        }

        maildrop.deleted.insert(number);
        self.reply(Reply::ok(format!("Message {number} deleted")));
    }

    fn cmd_rset(&mut self) {
        let Some(maildrop) = self.maildrop.as_mut() else {
            self.reply(Reply::err("Internal error"));
            return;
        };

        maildrop.deleted.clear();
        let count = maildrop.messages.len();
        self.reply(Reply::ok(format!("Maildrop has {count} messages")));
    }

    // --- Helpers ---------------------------------------------------------

    fn channel_view(&self) -> ChannelView {
        ChannelView {
            secure: self.endpoint.is_secure(),
            allow_plaintext: self.ctx.config.allow_plaintext,
            peer_common_name: self
                .endpoint
                .security_info()
                .and_then(|info| info.peer_common_name.clone()),
        }
    }

    fn reply(&mut self, reply: Reply) {
        self.endpoint.send(&reply.serialize());
    }

    fn reply_raw(&mut self, line: String) {
        self.endpoint.send(line.as_bytes());
    }
}

impl<E: Endpoint> Drop for Pop3Session<E> {
    fn drop(&mut self) {
        // Abnormal teardown: deletion marks are discarded, never applied.
        if let Some(mut maildrop) = self.maildrop.take() {
            let _ = maildrop.mailbox.close(false);
        }
        if let Some(mut user_store) = self.user_store.take() {
            user_store.close();
        }
    }
}
