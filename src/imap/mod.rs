//! The IMAP4rev2 protocol engine.
//!
//! One [`ImapSession`] owns one connection. It is a synchronous state
//! machine: the driver feeds it received bytes, it enqueues responses on
//! its [`Endpoint`] and returns. No method blocks and nothing here is
//! called from more than one thread.
//!
//! ```text
//!           +----------------------+
//!           |connection established|
//!           +----------------------+
//!                      ||
//!                      \/
//!    +--------------------------------------+
//!    |          server greeting             |
//!    +--------------------------------------+
//!              ||
//!              \/
//!    +-----------------+
//!    |Not Authenticated|
//!    +-----------------+
//!     ||       || (1)
//!     ||       \/
//!     ||     +----------------+
//!     ||     | Authenticated  |<=++
//!     ||     +----------------+  ||
//!     ||       ||       || (2)   || (3)
//!     ||       ||       \/       ||
//!     ||       ||    +--------+  ||
//!     ||       ||    |Selected|==++
//!     ||       ||    +--------+
//!     \/       \/       \/
//!    +--------------------------------------+
//!    |               Logout                 |
//!    +--------------------------------------+
//!
//! (1) successful LOGIN or AUTHENTICATE command
//! (2) successful SELECT or EXAMINE command
//! (3) CLOSE or UNSELECT command, or failed SELECT or EXAMINE command
//! ```

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use log::{debug, info, warn};

use crate::{
    config::ImapConfig,
    endpoint::Endpoint,
    error::{FatalError, StoreError},
    framer::LineFramer,
    quota::QuotaManager,
    realm::{Realm, ROLE_ADMIN},
    store::{Flag, FlagOp, MailStore, Mailbox, MailboxEvent, UserStore},
};

pub mod command;
pub mod datetime;
pub mod parser;
pub mod response;
pub mod search;
pub mod sequence;

use command::{
    Command, CommandBody, FetchItem, MailboxName, QuotaResource, StatusItem, Tag,
};
use parser::CommandError;
use response::{Capability, Code, Continue, Data, Encode, FetchValue, Status};

use crate::sasl::{
    Authenticated, ChannelView, Mechanism, SaslFailure, SaslOutcome, SaslSession,
};
use crate::secret::Secret;

/// State of an IMAP4rev2 connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// The client must supply credentials before most commands are
    /// permitted.
    NotAuthenticated,
    /// Credentials accepted; no mailbox is selected.
    Authenticated,
    /// A mailbox has been selected to access.
    Selected,
    /// The connection is being terminated; no transition leaves this
    /// state.
    Logout,
}

/// Per-listener collaborators shared by all of its connections.
pub struct ImapContext {
    pub config: ImapConfig,
    pub realm: Arc<dyn Realm>,
    pub store: Arc<dyn MailStore>,
    pub quota: Arc<dyn QuotaManager>,
    /// Whether a TLS server context is configured; gates STARTTLS.
    pub tls_available: bool,
}

struct SelectedMailbox {
    mailbox: Box<dyn Mailbox>,
    read_only: bool,
}

/// An APPEND literal in flight. While `remaining > 0`, received bytes
/// bypass line framing and flow into the mailbox's append sink.
struct AppendTransaction {
    tag: Tag,
    mailbox: Box<dyn Mailbox>,
    remaining: u64,
    total: u64,
    /// A sink failure was observed; the remaining octets are still
    /// consumed but the transaction ends in a NO.
    failed: bool,
}

/// One IMAP connection.
pub struct ImapSession<E: Endpoint> {
    ctx: Arc<ImapContext>,
    endpoint: E,
    framer: LineFramer,
    state: SessionState,
    principal: Option<Authenticated>,
    user_store: Option<Box<dyn UserStore>>,
    selected: Option<SelectedMailbox>,
    sasl: Option<(Tag, SaslSession)>,
    idle_tag: Option<Tag>,
    append: Option<AppendTransaction>,
    /// Octets of a rejected non-synchronising literal still on the wire.
    discard_remaining: u64,
    /// The CRLF that terminates the APPEND command line after its literal.
    swallow_crlf: bool,
    greeted: bool,
}

impl<E: Endpoint> ImapSession<E> {
    pub fn new(ctx: Arc<ImapContext>, endpoint: E) -> Self {
        let max_line_length = ctx.config.max_line_length;
        Self {
            ctx,
            endpoint,
            framer: LineFramer::new(max_line_length),
            state: SessionState::NotAuthenticated,
            principal: None,
            user_store: None,
            selected: None,
            sasl: None,
            idle_tag: None,
            append: None,
            discard_remaining: 0,
            swallow_crlf: false,
            greeted: false,
        }
    }

    pub fn endpoint_mut(&mut self) -> &mut E {
        &mut self.endpoint
    }

    /// Send the untagged greeting. On an implicit-TLS listener the driver
    /// calls this only once the handshake has completed.
    pub fn greet(&mut self) {
        if self.greeted {
            return;
        }
        self.greeted = true;

        let caps = self.capabilities();
        let host = self.ctx.config.host_name.clone();
        self.reply(&Status::Ok {
            tag: None,
            code: Some(Code::Capability(caps)),
            text: format!("{host} IMAP4rev2 service ready"),
        });
    }

    /// The driver reports a completed TLS handshake.
    pub fn security_established(&mut self) {
        debug!("IMAP connection to {} is now secure", self.endpoint.peer_addr());
    }

    /// Inactivity timer fired.
    pub fn timed_out(&mut self) {
        self.reply(&Status::bye("Autologout; idle for too long"));
        self.state = SessionState::Logout;
        self.endpoint.close();
    }

    /// Server is shutting down.
    pub fn shutdown(&mut self) {
        self.reply(&Status::bye("Server shutting down"));
        self.state = SessionState::Logout;
        self.endpoint.close();
    }

    /// The inactivity timeout that currently applies: the short login
    /// timeout before authentication, the long command timeout after.
    pub fn applicable_timeout(&self) -> Duration {
        if self.state == SessionState::NotAuthenticated {
            self.ctx.config.login_timeout
        } else {
            self.ctx.config.command_timeout
        }
    }

    /// Feed received bytes in; responses accumulate on the endpoint.
    ///
    /// A returned error is connection-fatal; the `* BYE` has already been
    /// enqueued and the endpoint asked to close.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<(), FatalError> {
        self.framer.extend(bytes);

        loop {
            // Octets of a rejected non-synchronising literal are consumed
            // and dropped so they are not mistaken for commands.
            if self.discard_remaining > 0 {
                let chunk = self.framer.take_raw(self.discard_remaining as usize);
                if chunk.is_empty() {
                    return Ok(());
                }
                self.discard_remaining -= chunk.len() as u64;
                if self.discard_remaining > 0 {
                    return Ok(());
                }
                self.swallow_crlf = true;
                continue;
            }

            // An active literal diverts raw bytes to the append sink.
            if let Some(append) = self.append.as_mut() {
                if append.remaining > 0 {
                    let chunk = self.framer.take_raw(append.remaining as usize);
                    if chunk.is_empty() {
                        return Ok(());
                    }
                    append.remaining -= chunk.len() as u64;
                    if !append.failed {
                        if let Err(error) = append.mailbox.append_content(&chunk) {
                            warn!("append sink failure: {error}");
                            append.failed = true;
                        }
                    }
                }
                if self.append.as_ref().is_some_and(|a| a.remaining == 0) {
                    self.finish_append();
                    continue;
                }
                return Ok(());
            }

            match self.framer.next_line() {
                Ok(Some(line)) => {
                    if self.swallow_crlf {
                        self.swallow_crlf = false;
                        if line.is_empty() {
                            continue;
                        }
                    }
                    self.handle_line(&line);
                }
                Ok(None) => return Ok(()),
                Err(fatal) => {
                    self.reply(&Status::bye(format!("Fatal protocol error: {fatal}")));
                    self.endpoint.close();
                    self.state = SessionState::Logout;
                    return Err(fatal);
                }
            }
        }
    }

    fn handle_line(&mut self, line: &Bytes) {
        // While idling, only DONE is accepted; anything else is rejected
        // without consuming IDLE state.
        if let Some(tag) = self.idle_tag.take() {
            if line.as_ref().eq_ignore_ascii_case(b"DONE") {
                self.push_mailbox_events();
                self.reply(&Status::ok(tag, None, "IDLE terminated"));
            } else {
                self.idle_tag = Some(tag);
                self.reply(&Status::Bad {
                    tag: None,
                    text: "Expected DONE".into(),
                });
            }
            return;
        }

        // A SASL exchange interprets lines as continuations, not commands.
        if let Some((tag, mut session)) = self.sasl.take() {
            if line.as_ref() == b"*" {
                self.reply(&Status::bad(tag, "AUTHENTICATE cancelled"));
                return;
            }
            let data = match BASE64.decode(line.as_ref()) {
                Ok(data) => data,
                Err(_) => {
                    self.reply(&Status::bad(tag, "Invalid base64 continuation"));
                    return;
                }
            };
            let outcome = session.respond(&data, self.ctx.realm.as_ref(), &self.channel_view());
            self.conclude_sasl(tag, session, outcome);
            return;
        }

        match parser::command(line.as_ref()) {
            Ok(command) => self.dispatch(command),
            Err(CommandError::BadTag) => {
                self.reply(&Status::Bad {
                    tag: None,
                    text: "Invalid tag".into(),
                });
            }
            Err(CommandError::Bad { tag, message }) => {
                self.reply(&Status::bad(tag, message));
            }
        }
    }

    fn dispatch(&mut self, command: Command) {
        use SessionState::*;

        let Command { tag, body } = command;

        if self.state == Logout {
            self.reply(&Status::bad(tag, "Session is logging out"));
            return;
        }

        let permitted = match &body {
            CommandBody::Capability | CommandBody::Noop | CommandBody::Logout => true,
            CommandBody::StartTls
            | CommandBody::Authenticate { .. }
            | CommandBody::Login { .. } => self.state == NotAuthenticated,
            CommandBody::Close
            | CommandBody::Unselect
            | CommandBody::Expunge
            | CommandBody::Search { .. }
            | CommandBody::Fetch { .. }
            | CommandBody::Store { .. }
            | CommandBody::Copy { .. }
            | CommandBody::Move { .. } => self.state == Selected,
            _ => matches!(self.state, Authenticated | Selected),
        };
        if !permitted {
            self.reply(&Status::bad(
                tag,
                format!("{} not permitted in this state", body.name()),
            ));
            return;
        }

        match body {
            CommandBody::Capability => self.cmd_capability(tag),
            CommandBody::Noop => self.cmd_noop(tag),
            CommandBody::Logout => self.cmd_logout(tag),
            CommandBody::StartTls => self.cmd_starttls(tag),
            CommandBody::Authenticate { mechanism, initial } => {
                self.cmd_authenticate(tag, mechanism, initial)
            }
            CommandBody::Login { username, password } => self.cmd_login(tag, username, password),
            CommandBody::Select { mailbox } => self.cmd_select(tag, mailbox, false),
            CommandBody::Examine { mailbox } => self.cmd_select(tag, mailbox, true),
            CommandBody::Create { mailbox } => self.cmd_create(tag, mailbox),
            CommandBody::Delete { mailbox } => self.cmd_delete(tag, mailbox),
            CommandBody::Rename { from, to } => self.cmd_rename(tag, from, to),
            CommandBody::Subscribe { mailbox } => self.cmd_subscribe(tag, mailbox, true),
            CommandBody::Unsubscribe { mailbox } => self.cmd_subscribe(tag, mailbox, false),
            CommandBody::List { reference, pattern } => {
                self.cmd_list(tag, reference, pattern, false)
            }
            CommandBody::Lsub { reference, pattern } => {
                self.cmd_list(tag, reference, pattern, true)
            }
            CommandBody::Namespace => self.cmd_namespace(tag),
            CommandBody::Status { mailbox, items } => self.cmd_status(tag, mailbox, items),
            CommandBody::Append {
                mailbox,
                flags,
                date,
                size,
                non_sync,
            } => self.cmd_append(tag, mailbox, flags, date, size, non_sync),
            CommandBody::Idle => self.cmd_idle(tag),
            CommandBody::GetQuota { root } => self.cmd_getquota(tag, root),
            CommandBody::GetQuotaRoot { mailbox } => self.cmd_getquotaroot(tag, mailbox),
            CommandBody::SetQuota { root, limits } => self.cmd_setquota(tag, root, limits),
            CommandBody::Close => self.cmd_close(tag),
            CommandBody::Unselect => self.cmd_unselect(tag),
            CommandBody::Expunge => self.cmd_expunge(tag),
            CommandBody::Search { criteria, uid } => self.cmd_search(tag, criteria, uid),
            CommandBody::Fetch { set, items, uid } => self.cmd_fetch(tag, set, items, uid),
            CommandBody::Store {
                set,
                op,
                silent,
                flags,
                uid,
            } => self.cmd_store(tag, set, op, silent, flags, uid),
            CommandBody::Copy { set, mailbox, uid } => self.cmd_copy(tag, set, mailbox, uid),
            CommandBody::Move { set, mailbox, uid } => self.cmd_move(tag, set, mailbox, uid),
        }
    }

    // --- Any state -------------------------------------------------------

    fn cmd_capability(&mut self, tag: Tag) {
        let caps = self.capabilities();
        self.reply(&Data::Capability(caps));
        self.reply(&Status::ok(tag, None, "CAPABILITY completed"));
    }

    fn cmd_noop(&mut self, tag: Tag) {
        self.push_mailbox_events();
        self.reply(&Status::ok(tag, None, "NOOP completed"));
    }

    fn cmd_logout(&mut self, tag: Tag) {
        self.reply(&Status::bye("Logging out"));
        self.release_resources(false);
        self.state = SessionState::Logout;
        self.reply(&Status::ok(tag, None, "LOGOUT completed"));
        self.endpoint.close();
    }

    // --- Not authenticated -----------------------------------------------

    fn cmd_starttls(&mut self, tag: Tag) {
        if self.endpoint.is_secure() {
            self.reply(&Status::bad(tag, "Connection is already secure"));
            return;
        }
        if !self.ctx.tls_available {
            self.reply(&Status::bad(tag, "TLS is not available"));
            return;
        }

        self.reply(&Status::ok(tag, None, "Begin TLS negotiation now"));
        self.endpoint.start_tls();
    }

    fn cmd_authenticate(&mut self, tag: Tag, mechanism: Mechanism, initial: Option<Vec<u8>>) {
        let (session, outcome) = SaslSession::start(
            mechanism,
            initial.as_deref(),
            self.ctx.realm.as_ref(),
            &self.channel_view(),
            &self.ctx.config.host_name,
        );

        self.conclude_sasl(tag, session, outcome);
    }

    fn cmd_login(&mut self, tag: Tag, username: String, password: Secret<String>) {
        if !self.endpoint.is_secure() && !self.ctx.config.allow_plaintext_login {
            self.reply(&Status::no(
                tag,
                Some(Code::PrivacyRequired),
                "Plaintext login is disabled on insecure connections",
            ));
            return;
        }

        match self
            .ctx
            .realm
            .password_match(&username, password.declassify())
        {
            Ok(true) => {
                let authenticated = Authenticated {
                    principal: username,
                    mechanism: Mechanism::Plain,
                };
                self.complete_authentication(tag, authenticated, "LOGIN completed");
            }
            Ok(false) => {
                warn!("LOGIN failed for {username}");
                self.reply(&Status::no(
                    tag,
                    Some(Code::AuthenticationFailed),
                    "Bad credentials",
                ));
            }
            Err(error) => {
                warn!("LOGIN: realm failure for {username}: {error}");
                self.reply(&Status::no(tag, None, "internal error"));
            }
        }
    }

    fn conclude_sasl(&mut self, tag: Tag, session: SaslSession, outcome: SaslOutcome) {
        match outcome {
            SaslOutcome::Proceed(payload) => {
                self.reply(&Continue::Base64(payload));
                self.sasl = Some((tag, session));
            }
            SaslOutcome::Success(authenticated) => {
                self.complete_authentication(tag, authenticated, "Authentication completed");
            }
            SaslOutcome::Failure(failure) => {
                warn!("AUTHENTICATE failed: {failure}");
                let status = match failure {
                    SaslFailure::PrivacyRequired(_) => Status::no(
                        tag,
                        Some(Code::PrivacyRequired),
                        failure.to_string(),
                    ),
                    SaslFailure::BadCredentials => Status::no(
                        tag,
                        Some(Code::AuthenticationFailed),
                        "Authentication failed",
                    ),
                    SaslFailure::Unsupported(mechanism) => Status::no(
                        tag,
                        None,
                        format!("{mechanism} is not supported"),
                    ),
                    SaslFailure::Malformed(reason) => Status::bad(tag, reason),
                    SaslFailure::Realm(error) => {
                        warn!("AUTHENTICATE: realm failure: {error}");
                        Status::no(tag, None, "internal error")
                    }
                };
                self.reply(&status);
            }
        }
    }

    fn complete_authentication(&mut self, tag: Tag, authenticated: Authenticated, text: &str) {
        match self.ctx.store.open(&authenticated.principal) {
            Ok(user_store) => {
                info!(
                    "{} authenticated via {}",
                    authenticated.principal, authenticated.mechanism
                );
                self.user_store = Some(user_store);
                self.principal = Some(authenticated);
                self.state = SessionState::Authenticated;

                let caps = self.capabilities();
                self.reply(&Status::ok(tag, Some(Code::Capability(caps)), text));
            }
            Err(error) => {
                warn!(
                    "store open failed for {}: {error}",
                    authenticated.principal
                );
                self.reply(&Status::no(tag, None, "internal error"));
            }
        }
    }

    // --- Authenticated ---------------------------------------------------

    fn cmd_select(&mut self, tag: Tag, mailbox: MailboxName, read_only: bool) {
        // Replacing a selection closes the previous mailbox, expunging
        // only if it was writable.
        self.close_selected(true);
        self.state = SessionState::Authenticated;

        let Some(user_store) = self.user_store.as_mut() else {
            self.reply(&Status::no(tag, None, "internal error"));
            return;
        };

        let handle = match user_store.open_mailbox(mailbox.as_str(), read_only) {
            Ok(handle) => handle,
            Err(error) => {
                self.reply(&Status::no(tag, None, format!("SELECT failed: {error}")));
                return;
            }
        };

        let exists = handle.message_count();
        let recent = handle
            .get_message_list()
            .map(|metas| {
                metas
                    .iter()
                    .filter(|meta| meta.flags.contains(&Flag::Recent))
                    .count() as u32
            })
            .unwrap_or(0);
        let flags = handle.permanent_flags();
        let uid_validity = handle.uid_validity();
        let uid_next = handle.uid_next();

        self.reply(&Data::Exists(exists));
        self.reply(&Data::Recent(recent));
        self.reply(&Data::Flags(flags.clone()));
        self.reply(&Status::Ok {
            tag: None,
            code: Some(Code::PermanentFlags(flags)),
            text: "Flags permitted".into(),
        });
        self.reply(&Status::Ok {
            tag: None,
            code: Some(Code::UidValidity(uid_validity)),
            text: "UIDs valid".into(),
        });
        self.reply(&Status::Ok {
            tag: None,
            code: Some(Code::UidNext(uid_next)),
            text: "Predicted next UID".into(),
        });
        self.reply(&Status::ok(
            tag,
            Some(if read_only {
                Code::ReadOnly
            } else {
                Code::ReadWrite
            }),
            "Select completed",
        ));

        self.selected = Some(SelectedMailbox {
            mailbox: handle,
            read_only,
        });
        self.state = SessionState::Selected;
    }

    fn cmd_create(&mut self, tag: Tag, mailbox: MailboxName) {
        if mailbox == MailboxName::Inbox {
            self.reply(&Status::no(tag, None, "INBOX always exists"));
            return;
        }
        self.simple_store_action(tag, "CREATE", |store| {
            store.create_mailbox(mailbox.as_str())
        });
    }

    fn cmd_delete(&mut self, tag: Tag, mailbox: MailboxName) {
        if mailbox == MailboxName::Inbox {
            self.reply(&Status::no(tag, None, "INBOX may not be deleted"));
            return;
        }
        self.simple_store_action(tag, "DELETE", |store| {
            store.delete_mailbox(mailbox.as_str())
        });
    }

    fn cmd_rename(&mut self, tag: Tag, from: MailboxName, to: MailboxName) {
        self.simple_store_action(tag, "RENAME", |store| {
            store.rename_mailbox(from.as_str(), to.as_str())
        });
    }

    fn cmd_subscribe(&mut self, tag: Tag, mailbox: MailboxName, subscribe: bool) {
        let name = if subscribe { "SUBSCRIBE" } else { "UNSUBSCRIBE" };
        self.simple_store_action(tag, name, |store| {
            if subscribe {
                store.subscribe(mailbox.as_str())
            } else {
                store.unsubscribe(mailbox.as_str())
            }
        });
    }

    fn simple_store_action(
        &mut self,
        tag: Tag,
        name: &str,
        action: impl FnOnce(&mut Box<dyn UserStore>) -> Result<(), StoreError>,
    ) {
        let Some(user_store) = self.user_store.as_mut() else {
            self.reply(&Status::no(tag, None, "internal error"));
            return;
        };

        match action(user_store) {
            Ok(()) => self.reply(&Status::ok(tag, None, format!("{name} completed"))),
            Err(error) => {
                debug!("{name} failed: {error}");
                self.reply(&Status::no(tag, None, format!("{name} failed: {error}")));
            }
        }
    }

    fn cmd_list(&mut self, tag: Tag, reference: String, pattern: String, subscribed: bool) {
        let Some(user_store) = self.user_store.as_ref() else {
            self.reply(&Status::no(tag, None, "internal error"));
            return;
        };
        let delimiter = user_store.hierarchy_delimiter();
        let keyword = if subscribed { "LSUB" } else { "LIST" };

        // An empty pattern only asks for the hierarchy delimiter.
        if pattern.is_empty() {
            self.reply(&Data::List {
                info: crate::store::MailboxInfo {
                    name: String::new(),
                    no_select: true,
                    has_children: false,
                },
                delimiter,
            });
            self.reply(&Status::ok(tag, None, format!("{keyword} completed")));
            return;
        }

        let rows = if subscribed {
            user_store.list_subscribed(&reference, &pattern)
        } else {
            user_store.list(&reference, &pattern)
        };

        match rows {
            Ok(rows) => {
                for info in rows {
                    let data = if subscribed {
                        Data::Lsub { info, delimiter }
                    } else {
                        Data::List { info, delimiter }
                    };
                    self.reply(&data);
                }
                self.reply(&Status::ok(tag, None, format!("{keyword} completed")));
            }
            Err(error) => {
                self.reply(&Status::no(tag, None, format!("{keyword} failed: {error}")));
            }
        }
    }

    fn cmd_namespace(&mut self, tag: Tag) {
        if !self.ctx.config.enable_namespace {
            self.reply(&Status::bad(tag, "NAMESPACE is not enabled"));
            return;
        }
        let Some(user_store) = self.user_store.as_ref() else {
            self.reply(&Status::no(tag, None, "internal error"));
            return;
        };
        let prefix = user_store.personal_namespace();
        let delimiter = user_store.hierarchy_delimiter();

        self.reply(&Data::Namespace { prefix, delimiter });
        self.reply(&Status::ok(tag, None, "NAMESPACE completed"));
    }

    fn cmd_status(&mut self, tag: Tag, mailbox: MailboxName, items: Vec<StatusItem>) {
        let Some(user_store) = self.user_store.as_ref() else {
            self.reply(&Status::no(tag, None, "internal error"));
            return;
        };

        match user_store.mailbox_attributes(mailbox.as_str()) {
            Ok(attributes) => {
                let values = items
                    .iter()
                    .map(|item| {
                        let value = match item {
                            StatusItem::Messages => u64::from(attributes.messages),
                            StatusItem::UidNext => u64::from(attributes.uid_next),
                            StatusItem::UidValidity => u64::from(attributes.uid_validity),
                            StatusItem::Unseen => u64::from(attributes.unseen),
                            StatusItem::Size => attributes.size,
                        };
                        (*item, value)
                    })
                    .collect();
                self.reply(&Data::Status {
                    mailbox: mailbox.as_str().to_owned(),
                    items: values,
                });
                self.reply(&Status::ok(tag, None, "STATUS completed"));
            }
            Err(error) => {
                self.reply(&Status::no(tag, None, format!("STATUS failed: {error}")));
            }
        }
    }

    fn cmd_append(
        &mut self,
        tag: Tag,
        mailbox: MailboxName,
        flags: Vec<Flag>,
        date: Option<chrono::DateTime<chrono::FixedOffset>>,
        size: u64,
        non_sync: bool,
    ) {
        if size > self.ctx.config.max_literal_size {
            if non_sync {
                self.discard_remaining = size;
            }
            self.reply(&Status::no(tag, None, "Literal exceeds maximum size"));
            return;
        }

        // Quota must be checked before the continuation is emitted.
        let principal = self
            .principal
            .as_ref()
            .map(|auth| auth.principal.clone())
            .unwrap_or_default();
        if self.ctx.config.enable_quota && !self.ctx.quota.can_store(&principal, size) {
            if non_sync {
                self.discard_remaining = size;
            }
            self.reply(&Status::no(tag, Some(Code::OverQuota), "Quota exceeded"));
            return;
        }

        let Some(user_store) = self.user_store.as_mut() else {
            self.reply(&Status::no(tag, None, "internal error"));
            return;
        };

        let mut handle = match user_store.open_mailbox(mailbox.as_str(), false) {
            Ok(handle) => handle,
            Err(error) => {
                debug!("APPEND: cannot open {mailbox}: {error}");
                if non_sync {
                    self.discard_remaining = size;
                }
                self.reply(&Status::no(
                    tag,
                    Some(Code::TryCreate),
                    format!("APPEND failed: {error}"),
                ));
                return;
            }
        };

        if let Err(error) = handle.start_append(&flags, date) {
            if non_sync {
                self.discard_remaining = size;
            }
            self.reply(&Status::no(
                tag,
                Some(Code::TryCreate),
                format!("APPEND failed: {error}"),
            ));
            return;
        }

        if !non_sync {
            self.reply(&Continue::Basic("Ready for literal data".into()));
        }

        self.append = Some(AppendTransaction {
            tag,
            mailbox: handle,
            remaining: size,
            total: size,
            failed: false,
        });

        // A zero-length literal completes immediately.
        if size == 0 {
            self.finish_append();
        }
    }

    fn finish_append(&mut self) {
        let Some(mut append) = self.append.take() else {
            return;
        };
        self.swallow_crlf = true;

        if append.failed {
            append.mailbox.abort_append();
            let _ = append.mailbox.close(false);
            self.reply(&Status::no(
                append.tag,
                Some(Code::TryCreate),
                "APPEND failed: storage error",
            ));
            return;
        }

        let uid_validity = append.mailbox.uid_validity();
        match append.mailbox.end_append() {
            Ok(uid) => {
                let principal = self
                    .principal
                    .as_ref()
                    .map(|auth| auth.principal.clone())
                    .unwrap_or_default();
                self.ctx.quota.record_message_added(&principal, append.total);
                let _ = append.mailbox.close(false);
                self.reply(&Status::ok(
                    append.tag,
                    Some(Code::AppendUid {
                        validity: uid_validity,
                        uid,
                    }),
                    "APPEND completed",
                ));
            }
            Err(error) => {
                warn!("APPEND finalisation failed: {error}");
                let _ = append.mailbox.close(false);
                self.reply(&Status::no(
                    append.tag,
                    Some(Code::TryCreate),
                    "APPEND failed: storage error",
                ));
            }
        }
    }

    fn cmd_idle(&mut self, tag: Tag) {
        if !self.ctx.config.enable_idle {
            self.reply(&Status::bad(tag, "IDLE is not enabled"));
            return;
        }

        self.reply(&Continue::Basic("idling".into()));
        self.push_mailbox_events();
        self.idle_tag = Some(tag);
    }

    // --- QUOTA -----------------------------------------------------------

    fn cmd_getquota(&mut self, tag: Tag, root: String) {
        if !self.ctx.config.enable_quota {
            self.reply(&Status::bad(tag, "QUOTA is not enabled"));
            return;
        }

        let principal = match self.principal.as_ref() {
            Some(auth) => auth.principal.clone(),
            None => {
                self.reply(&Status::no(tag, None, "internal error"));
                return;
            }
        };
        let owner = if root.is_empty() {
            principal.clone()
        } else {
            root.clone()
        };

        if owner != principal && !self.is_admin(&principal) {
            self.reply(&Status::no(tag, None, "Quota root not accessible"));
            return;
        }

        let data = self.quota_data(&root, &owner);
        self.reply(&data);
        self.reply(&Status::ok(tag, None, "GETQUOTA completed"));
    }

    fn cmd_getquotaroot(&mut self, tag: Tag, mailbox: MailboxName) {
        if !self.ctx.config.enable_quota {
            self.reply(&Status::bad(tag, "QUOTA is not enabled"));
            return;
        }

        let principal = match self.principal.as_ref() {
            Some(auth) => auth.principal.clone(),
            None => {
                self.reply(&Status::no(tag, None, "internal error"));
                return;
            }
        };

        self.reply(&Data::QuotaRoot {
            mailbox: mailbox.as_str().to_owned(),
            roots: vec![String::new()],
        });
        let data = self.quota_data("", &principal);
        self.reply(&data);
        self.reply(&Status::ok(tag, None, "GETQUOTAROOT completed"));
    }

    fn cmd_setquota(&mut self, tag: Tag, root: String, limits: Vec<(QuotaResource, u64)>) {
        if !self.ctx.config.enable_quota {
            self.reply(&Status::bad(tag, "QUOTA is not enabled"));
            return;
        }

        let principal = match self.principal.as_ref() {
            Some(auth) => auth.principal.clone(),
            None => {
                self.reply(&Status::no(tag, None, "internal error"));
                return;
            }
        };
        if !self.is_admin(&principal) {
            self.reply(&Status::no(tag, None, "SETQUOTA requires administrator rights"));
            return;
        }

        let owner = if root.is_empty() {
            principal
        } else {
            root.clone()
        };

        let mut storage_limit = None;
        let mut message_limit = None;
        for (resource, value) in limits {
            match resource {
                // STORAGE limits arrive in kibibytes.
                QuotaResource::Storage => storage_limit = Some(value * 1024),
                QuotaResource::Message => message_limit = Some(value),
            }
        }

        self.ctx
            .quota
            .set_user_quota(&owner, storage_limit, message_limit);

        let data = self.quota_data(&root, &owner);
        self.reply(&data);
        self.reply(&Status::ok(tag, None, "SETQUOTA completed"));
    }

    fn quota_data(&self, root: &str, owner: &str) -> Data {
        let quota = self.ctx.quota.get_quota(owner);
        let mut resources = Vec::new();

        if let Some(limit) = quota.storage_limit {
            resources.push((
                "STORAGE",
                quota.storage_used.div_ceil(1024),
                limit / 1024,
            ));
        }
        if let Some(limit) = quota.message_limit {
            resources.push(("MESSAGE", quota.message_count, limit));
        }

        Data::Quota {
            root: root.to_owned(),
            resources,
        }
    }

    fn is_admin(&self, principal: &str) -> bool {
        self.ctx
            .realm
            .is_user_in_role(principal, ROLE_ADMIN)
            .unwrap_or(false)
    }

    // --- Selected --------------------------------------------------------

    fn cmd_close(&mut self, tag: Tag) {
        self.close_selected(true);
        self.state = SessionState::Authenticated;
        self.reply(&Status::ok(tag, None, "CLOSE completed"));
    }

    fn cmd_unselect(&mut self, tag: Tag) {
        self.close_selected(false);
        self.state = SessionState::Authenticated;
        self.reply(&Status::ok(tag, None, "UNSELECT completed"));
    }

    fn cmd_expunge(&mut self, tag: Tag) {
        if self.selected.as_ref().is_some_and(|s| s.read_only) {
            self.reply(&Status::no(tag, None, "Mailbox is read-only"));
            return;
        }
        let Some(selected) = self.selected.as_mut() else {
            self.reply(&Status::no(tag, None, "internal error"));
            return;
        };

        match selected.mailbox.expunge() {
            Ok(expunged) => {
                for seq in expunged {
                    self.reply(&Data::Expunge(seq));
                }
                self.reply(&Status::ok(tag, None, "EXPUNGE completed"));
            }
            Err(error) => {
                self.reply(&Status::no(tag, None, format!("EXPUNGE failed: {error}")));
            }
        }
    }

    fn cmd_search(&mut self, tag: Tag, criteria: search::SearchKey, uid: bool) {
        let Some(selected) = self.selected.as_ref() else {
            self.reply(&Status::no(tag, None, "internal error"));
            return;
        };

        match selected.mailbox.search(&criteria) {
            Ok(sequences) => {
                let numbers = if uid {
                    sequences
                        .iter()
                        .filter_map(|seq| {
                            selected.mailbox.get_message(*seq).ok().map(|meta| meta.uid)
                        })
                        .collect()
                } else {
                    sequences
                };
                self.reply(&Data::Search(numbers));
                self.reply(&Status::ok(tag, None, "SEARCH completed"));
            }
            Err(error) => {
                debug!("SEARCH failed: {error}");
                self.reply(&Status::no(tag, None, format!("SEARCH failed: {error}")));
            }
        }
    }

    /// Resolve a sequence set against the selection, by UID or sequence
    /// number, to plain sequence numbers.
    fn resolve_set(
        selected: &SelectedMailbox,
        set: &sequence::SequenceSet,
        uid: bool,
    ) -> Result<Vec<u32>, StoreError> {
        if uid {
            let metas = selected.mailbox.get_message_list()?;
            let largest = metas.iter().map(|meta| meta.uid).max().unwrap_or(0);
            Ok(metas
                .iter()
                .filter(|meta| set.contains(meta.uid, largest))
                .map(|meta| meta.sequence)
                .collect())
        } else {
            Ok(set.expand(selected.mailbox.message_count()))
        }
    }

    fn cmd_fetch(&mut self, tag: Tag, set: sequence::SequenceSet, items: Vec<FetchItem>, uid: bool) {
        let rows = match self.selected.as_mut() {
            Some(selected) => Self::fetch_rows(selected, &set, &items, uid),
            None => {
                self.reply(&Status::no(tag, None, "internal error"));
                return;
            }
        };

        match rows {
            Ok(rows) => {
                for row in rows {
                    self.reply(&row);
                }
                self.reply(&Status::ok(tag, None, "FETCH completed"));
            }
            Err(error) => {
                self.reply(&Status::no(tag, None, format!("FETCH failed: {error}")));
            }
        }
    }

    fn fetch_rows(
        selected: &mut SelectedMailbox,
        set: &sequence::SequenceSet,
        items: &[FetchItem],
        uid: bool,
    ) -> Result<Vec<Data>, StoreError> {
        let sequences = Self::resolve_set(selected, set, uid)?;
        let mut rows = Vec::new();

        for seq in sequences {
            let meta = selected.mailbox.get_message(seq)?;

            let mut values = Vec::new();
            // UID FETCH responses always carry the UID.
            if uid && !items.contains(&FetchItem::Uid) {
                values.push(FetchValue::Uid(meta.uid));
            }
            let mut fetched_body = false;
            for item in items {
                match item {
                    FetchItem::Uid => values.push(FetchValue::Uid(meta.uid)),
                    FetchItem::Flags => values.push(FetchValue::Flags(meta.flags.clone())),
                    FetchItem::Rfc822Size => values.push(FetchValue::Rfc822Size(meta.size)),
                    FetchItem::InternalDate => {
                        values.push(FetchValue::InternalDate(meta.internal_date))
                    }
                    FetchItem::Body { peek } => {
                        let mut reader = selected.mailbox.get_message_content(seq)?;
                        let mut content = Vec::new();
                        reader.read_to_end(&mut content)?;
                        values.push(FetchValue::Body(content));
                        fetched_body = !peek;
                    }
                }
            }

            // An unpeeked body fetch implicitly sets \Seen.
            if fetched_body && !selected.read_only {
                let _ = selected.mailbox.store_flags(seq, FlagOp::Add, &[Flag::Seen]);
            }

            rows.push(Data::Fetch { seq, values });
        }

        Ok(rows)
    }

    fn cmd_store(
        &mut self,
        tag: Tag,
        set: sequence::SequenceSet,
        op: FlagOp,
        silent: bool,
        flags: Vec<Flag>,
        uid: bool,
    ) {
        if self.selected.as_ref().is_some_and(|s| s.read_only) {
            self.reply(&Status::no(tag, None, "Mailbox is read-only"));
            return;
        }
        let Some(selected) = self.selected.as_mut() else {
            self.reply(&Status::no(tag, None, "internal error"));
            return;
        };

        let rows = (|| -> Result<Vec<Data>, StoreError> {
            let sequences = Self::resolve_set(selected, &set, uid)?;
            let mut rows = Vec::new();
            for seq in sequences {
                let new_flags = selected.mailbox.store_flags(seq, op, &flags)?;
                if !silent {
                    let mut values = vec![FetchValue::Flags(new_flags)];
                    if uid {
                        values.insert(0, FetchValue::Uid(selected.mailbox.get_message(seq)?.uid));
                    }
                    rows.push(Data::Fetch { seq, values });
                }
            }
            Ok(rows)
        })();

        match rows {
            Ok(rows) => {
                for row in rows {
                    self.reply(&row);
                }
                self.reply(&Status::ok(tag, None, "STORE completed"));
            }
            Err(error) => {
                self.reply(&Status::no(tag, None, format!("STORE failed: {error}")));
            }
        }
    }

    fn cmd_copy(&mut self, tag: Tag, set: sequence::SequenceSet, mailbox: MailboxName, uid: bool) {
        match self.copy_messages(&set, &mailbox, uid) {
            Ok(_) => self.reply(&Status::ok(tag, None, "COPY completed")),
            Err(CopyFailure::NoSuchMailbox(error)) => {
                self.reply(&Status::no(tag, Some(Code::TryCreate), error.to_string()));
            }
            Err(CopyFailure::OverQuota) => {
                self.reply(&Status::no(tag, Some(Code::OverQuota), "Quota exceeded"));
            }
            Err(CopyFailure::Store(error)) => {
                self.reply(&Status::no(tag, None, format!("COPY failed: {error}")));
            }
        }
    }

    fn cmd_move(&mut self, tag: Tag, set: sequence::SequenceSet, mailbox: MailboxName, uid: bool) {
        if !self.ctx.config.enable_move {
            self.reply(&Status::bad(tag, "MOVE is not enabled"));
            return;
        }

        let moved = match self.copy_messages(&set, &mailbox, uid) {
            Ok(moved) => moved,
            Err(CopyFailure::NoSuchMailbox(error)) => {
                self.reply(&Status::no(tag, Some(Code::TryCreate), error.to_string()));
                return;
            }
            Err(CopyFailure::OverQuota) => {
                self.reply(&Status::no(tag, Some(Code::OverQuota), "Quota exceeded"));
                return;
            }
            Err(CopyFailure::Store(error)) => {
                self.reply(&Status::no(tag, None, format!("MOVE failed: {error}")));
                return;
            }
        };

        let expunged = match self.selected.as_mut() {
            Some(selected) => (|| -> Result<Vec<u32>, StoreError> {
                for seq in &moved {
                    selected.mailbox.delete_message(*seq)?;
                }
                selected.mailbox.expunge()
            })(),
            None => {
                self.reply(&Status::no(tag, None, "internal error"));
                return;
            }
        };

        match expunged {
            Ok(expunged) => {
                for seq in expunged {
                    self.reply(&Data::Expunge(seq));
                }
                self.reply(&Status::ok(tag, None, "MOVE completed"));
            }
            Err(error) => {
                self.reply(&Status::no(tag, None, format!("MOVE failed: {error}")));
            }
        }
    }

    /// Copy the denoted messages into `dest`; returns their sequence
    /// numbers.
    fn copy_messages(
        &mut self,
        set: &sequence::SequenceSet,
        dest: &MailboxName,
        uid: bool,
    ) -> Result<Vec<u32>, CopyFailure> {
        let principal = self
            .principal
            .as_ref()
            .map(|auth| auth.principal.clone())
            .unwrap_or_default();

        let selected = self
            .selected
            .as_mut()
            .ok_or_else(|| CopyFailure::Store(StoreError::Other("no selection".into())))?;
        let sequences = Self::resolve_set(selected, set, uid).map_err(CopyFailure::Store)?;

        let total: u64 = sequences
            .iter()
            .filter_map(|seq| selected.mailbox.get_message(*seq).ok())
            .map(|meta| meta.size)
            .sum();
        if self.ctx.config.enable_quota && !self.ctx.quota.can_store(&principal, total) {
            return Err(CopyFailure::OverQuota);
        }

        let user_store = self
            .user_store
            .as_mut()
            .ok_or_else(|| CopyFailure::Store(StoreError::Other("no store".into())))?;
        let mut target = user_store
            .open_mailbox(dest.as_str(), false)
            .map_err(CopyFailure::NoSuchMailbox)?;

        for seq in &sequences {
            let meta = selected.mailbox.get_message(*seq).map_err(CopyFailure::Store)?;
            let mut reader = selected
                .mailbox
                .get_message_content(*seq)
                .map_err(CopyFailure::Store)?;
            let mut content = Vec::new();
            reader
                .read_to_end(&mut content)
                .map_err(|error| CopyFailure::Store(StoreError::from(error)))?;

            let flags: Vec<Flag> = meta
                .flags
                .iter()
                .filter(|flag| **flag != Flag::Recent)
                .cloned()
                .collect();
            target
                .start_append(&flags, Some(meta.internal_date))
                .map_err(CopyFailure::Store)?;
            target.append_content(&content).map_err(CopyFailure::Store)?;
            target.end_append().map_err(CopyFailure::Store)?;
            self.ctx.quota.record_message_added(&principal, meta.size);
        }

        let _ = target.close(false);
        Ok(sequences)
    }

    // --- Helpers ---------------------------------------------------------

    fn capabilities(&self) -> Vec<Capability> {
        let config = &self.ctx.config;
        let secure = self.endpoint.is_secure();
        let mut caps = vec![Capability::Imap4Rev2];

        if !secure && self.ctx.tls_available {
            caps.push(Capability::StartTls);
        }

        if self.state == SessionState::NotAuthenticated {
            if !secure && !config.allow_plaintext_login {
                caps.push(Capability::LoginDisabled);
            }
            for mechanism in self.ctx.realm.sasl_mechanisms() {
                if secure || !mechanism.requires_tls(config.allow_plaintext_login) {
                    caps.push(Capability::Auth(mechanism));
                }
            }
        }

        if config.enable_idle {
            caps.push(Capability::Idle);
        }
        if config.enable_namespace {
            caps.push(Capability::Namespace);
        }
        if config.enable_quota {
            caps.push(Capability::Quota);
            caps.push(Capability::QuotaResStorage);
        }
        if config.enable_move {
            caps.push(Capability::Move);
        }
        caps.push(Capability::Unselect);
        caps.push(Capability::LiteralPlus);

        caps
    }

    fn channel_view(&self) -> ChannelView {
        ChannelView {
            secure: self.endpoint.is_secure(),
            allow_plaintext: self.ctx.config.allow_plaintext_login,
            peer_common_name: self
                .endpoint
                .security_info()
                .and_then(|info| info.peer_common_name.clone()),
        }
    }

    /// Emit untagged responses for events the store accumulated.
    fn push_mailbox_events(&mut self) {
        let mut responses = Vec::new();
        if let Some(selected) = self.selected.as_mut() {
            for event in selected.mailbox.drain_events() {
                responses.push(match event {
                    MailboxEvent::Exists(n) => Data::Exists(n),
                    MailboxEvent::Recent(n) => Data::Recent(n),
                    MailboxEvent::Expunge(n) => Data::Expunge(n),
                });
            }
        }
        for response in responses {
            self.reply(&response);
        }
    }

    fn close_selected(&mut self, expunge_if_writable: bool) {
        if let Some(mut selected) = self.selected.take() {
            let expunge = expunge_if_writable && !selected.read_only;
            if let Err(error) = selected.mailbox.close(expunge) {
                warn!("closing mailbox failed: {error}");
            }
        }
    }

    /// Drop every held resource; partial appends are discarded.
    fn release_resources(&mut self, expunge_selected: bool) {
        if let Some(mut append) = self.append.take() {
            append.mailbox.abort_append();
            let _ = append.mailbox.close(false);
        }
        self.close_selected(expunge_selected);
        if let Some(mut user_store) = self.user_store.take() {
            user_store.close();
        }
    }

    fn reply(&mut self, item: &impl Encode) {
        self.endpoint.send(&item.to_bytes());
    }
}

impl<E: Endpoint> Drop for ImapSession<E> {
    fn drop(&mut self) {
        // Abnormal teardown: never expunge, never commit partial appends.
        self.release_resources(false);
    }
}

enum CopyFailure {
    NoSuchMailbox(StoreError),
    OverQuota,
    Store(StoreError),
}
