//! In-memory collaborators for tests and examples.
//!
//! [`MemoryRealm`], [`MemoryStore`], and [`MemoryQuota`] implement the
//! realm, store, and quota interfaces entirely in memory, which lets a
//! whole session run against [`crate::endpoint::BufferedEndpoint`]
//! without any I/O. The realm derives every mechanism's expected answers
//! from stored plaintext passwords, so the same fixture serves PLAIN,
//! CRAM-MD5, DIGEST-MD5, SCRAM, and APOP exchanges.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, FixedOffset};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;

use crate::{
    error::{RealmError, StoreError},
    imap::search::SearchKey,
    quota::{Quota, QuotaManager},
    realm::{Lookup, Realm, ScramCredentials},
    sasl::{scram, Mechanism, ALL_MECHANISMS},
    store::{
        Flag, FlagOp, MailStore, Mailbox, MailboxAttributes, MailboxEvent, MailboxInfo,
        MessageMeta, UserStore,
    },
};

const SCRAM_SALT: &[u8] = b"memory-realm-salt";
const SCRAM_ITERATIONS: u32 = 4096;

// --- Realm ---------------------------------------------------------------

/// A realm backed by a plaintext user table.
#[derive(Default)]
pub struct MemoryRealm {
    users: HashMap<String, String>,
    tokens: HashMap<String, String>,
    roles: HashMap<String, BTreeSet<String>>,
}

impl MemoryRealm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&mut self, user: &str, password: &str) {
        self.users.insert(user.to_owned(), password.to_owned());
    }

    pub fn add_bearer_token(&mut self, token: &str, principal: &str) {
        self.tokens.insert(token.to_owned(), principal.to_owned());
    }

    pub fn add_role(&mut self, user: &str, role: &str) {
        self.roles
            .entry(user.to_owned())
            .or_default()
            .insert(role.to_owned());
    }

    /// The CRAM-MD5 digest a client would send for `challenge`.
    pub fn hmac_md5_hex(password: &str, challenge: &str) -> String {
        let mut mac = Hmac::<Md5>::new_from_slice(password.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(challenge.as_bytes());
        hex(&mac.finalize().into_bytes())
    }

    /// The APOP digest a client would send for `timestamp`.
    pub fn apop_digest(timestamp: &str, password: &str) -> String {
        hex(&Md5::digest(format!("{timestamp}{password}").as_bytes()))
    }

    /// Compute a SCRAM-SHA-256 `client-final-message`, the way a client
    /// would, from the server-first message.
    pub fn scram_client_final(
        password: &str,
        client_first_bare: &str,
        server_first: &str,
    ) -> String {
        let mut nonce = "";
        let mut salt = Vec::new();
        let mut iterations = 0u32;
        for attr in server_first.split(',') {
            if let Some(value) = attr.strip_prefix("r=") {
                nonce = value;
            } else if let Some(value) = attr.strip_prefix("s=") {
                salt = BASE64.decode(value).expect("salt is base64");
            } else if let Some(value) = attr.strip_prefix("i=") {
                iterations = value.parse().expect("iteration count is numeric");
            }
        }

        // Hi(password, salt, i)
        let mut block = salt.clone();
        block.extend_from_slice(&1u32.to_be_bytes());
        let mut u = hmac_sha256(password.as_bytes(), &block);
        let mut salted = u.clone();
        for _ in 1..iterations {
            u = hmac_sha256(password.as_bytes(), &u);
            for (acc, byte) in salted.iter_mut().zip(u.iter()) {
                *acc ^= byte;
            }
        }

        let client_key = hmac_sha256(&salted, b"Client Key");
        let stored_key = Sha256::digest(&client_key);

        let without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
        let signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        format!("{without_proof},p={}", BASE64.encode(proof))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl Realm for MemoryRealm {
    fn password_match(&self, user: &str, password: &str) -> Result<bool, RealmError> {
        Ok(self.users.get(user).is_some_and(|stored| stored == password))
    }

    fn user_exists(&self, user: &str) -> Result<bool, RealmError> {
        Ok(self.users.contains_key(user))
    }

    fn cram_md5_response(
        &self,
        user: &str,
        challenge: &str,
    ) -> Result<Lookup<String>, RealmError> {
        Ok(match self.users.get(user) {
            Some(password) => Lookup::Found(Self::hmac_md5_hex(password, challenge)),
            None => Lookup::NoSuchUser,
        })
    }

    fn digest_ha1(&self, user: &str, realm: &str) -> Result<Lookup<String>, RealmError> {
        Ok(match self.users.get(user) {
            Some(password) => Lookup::Found(hex(&Md5::digest(
                format!("{user}:{realm}:{password}").as_bytes(),
            ))),
            None => Lookup::NoSuchUser,
        })
    }

    fn scram_credentials(&self, user: &str) -> Result<Lookup<ScramCredentials>, RealmError> {
        Ok(match self.users.get(user) {
            Some(password) => Lookup::Found(scram::derive_credentials(
                password,
                SCRAM_SALT,
                SCRAM_ITERATIONS,
            )),
            None => Lookup::NoSuchUser,
        })
    }

    fn validate_bearer_token(&self, token: &str) -> Result<Lookup<String>, RealmError> {
        Ok(match self.tokens.get(token) {
            Some(principal) => Lookup::Found(principal.clone()),
            None => Lookup::NoSuchUser,
        })
    }

    fn apop_response(&self, user: &str, timestamp: &str) -> Result<Lookup<String>, RealmError> {
        Ok(match self.users.get(user) {
            Some(password) => Lookup::Found(Self::apop_digest(timestamp, password)),
            None => Lookup::NoSuchUser,
        })
    }

    fn is_user_in_role(&self, user: &str, role: &str) -> Result<bool, RealmError> {
        Ok(self
            .roles
            .get(user)
            .is_some_and(|roles| roles.contains(role)))
    }

    fn sasl_mechanisms(&self) -> Vec<Mechanism> {
        ALL_MECHANISMS.to_vec()
    }
}

// --- Store ---------------------------------------------------------------

struct StoredMessage {
    uid: u32,
    flags: Vec<Flag>,
    internal_date: DateTime<FixedOffset>,
    content: Vec<u8>,
}

impl StoredMessage {
    fn meta(&self, sequence: u32) -> MessageMeta {
        MessageMeta {
            sequence,
            uid: self.uid,
            size: self.content.len() as u64,
            flags: self.flags.clone(),
            internal_date: self.internal_date,
        }
    }
}

struct MailboxData {
    uid_validity: u32,
    uid_next: u32,
    messages: Vec<StoredMessage>,
    events: Vec<MailboxEvent>,
}

impl MailboxData {
    fn new(uid_validity: u32) -> Self {
        Self {
            uid_validity,
            uid_next: 1,
            messages: Vec::new(),
            events: Vec::new(),
        }
    }
}

#[derive(Default)]
struct UserData {
    mailboxes: BTreeMap<String, MailboxData>,
    subscriptions: BTreeSet<String>,
}

type Shared = Arc<Mutex<HashMap<String, UserData>>>;

/// A mailbox store held entirely in memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    users: Shared,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a user with an empty INBOX.
    pub fn add_user(&self, user: &str) {
        let mut users = self.users.lock().expect("store lock");
        users
            .entry(user.to_owned())
            .or_default()
            .mailboxes
            .entry("INBOX".to_owned())
            .or_insert_with(|| MailboxData::new(1));
    }

    /// Seed a message; returns its UID.
    pub fn add_message(&self, user: &str, mailbox: &str, content: &[u8]) -> u32 {
        let mut users = self.users.lock().expect("store lock");
        let data = users
            .entry(user.to_owned())
            .or_default()
            .mailboxes
            .entry(mailbox.to_owned())
            .or_insert_with(|| MailboxData::new(1));

        let uid = data.uid_next;
        data.uid_next += 1;
        data.messages.push(StoredMessage {
            uid,
            flags: vec![Flag::Recent],
            internal_date: epoch_date(),
            content: content.to_vec(),
        });
        let count = data.messages.len() as u32;
        data.events.push(MailboxEvent::Exists(count));
        uid
    }

    /// Current message count, for assertions across sessions.
    pub fn message_count(&self, user: &str, mailbox: &str) -> u32 {
        let users = self.users.lock().expect("store lock");
        users
            .get(user)
            .and_then(|data| data.mailboxes.get(mailbox))
            .map(|data| data.messages.len() as u32)
            .unwrap_or(0)
    }
}

fn epoch_date() -> DateTime<FixedOffset> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    DateTime::from_timestamp(secs, 0)
        .unwrap_or_default()
        .fixed_offset()
}

impl MailStore for MemoryStore {
    fn open(&self, user: &str) -> Result<Box<dyn UserStore>, StoreError> {
        let users = self.users.lock().expect("store lock");
        if !users.contains_key(user) {
            return Err(StoreError::Denied(format!("no maildrop for {user}")));
        }

        Ok(Box::new(MemoryUserStore {
            shared: Arc::clone(&self.users),
            user: user.to_owned(),
        }))
    }
}

pub struct MemoryUserStore {
    shared: Shared,
    user: String,
}

impl MemoryUserStore {
    fn with_user<T>(
        &self,
        f: impl FnOnce(&mut UserData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut users = self.shared.lock().expect("store lock");
        let data = users
            .get_mut(&self.user)
            .ok_or_else(|| StoreError::Denied(format!("no maildrop for {}", self.user)))?;
        f(data)
    }
}

impl UserStore for MemoryUserStore {
    fn open_mailbox(
        &mut self,
        name: &str,
        read_only: bool,
    ) -> Result<Box<dyn Mailbox>, StoreError> {
        self.with_user(|data| {
            if !data.mailboxes.contains_key(name) {
                return Err(StoreError::NoSuchMailbox(name.to_owned()));
            }
            Ok(())
        })?;

        Ok(Box::new(MemoryMailbox {
            shared: Arc::clone(&self.shared),
            user: self.user.clone(),
            name: name.to_owned(),
            read_only,
            append: None,
        }))
    }

    fn create_mailbox(&mut self, name: &str) -> Result<(), StoreError> {
        self.with_user(|data| {
            if data.mailboxes.contains_key(name) {
                return Err(StoreError::MailboxExists(name.to_owned()));
            }
            data.mailboxes.insert(name.to_owned(), MailboxData::new(1));
            Ok(())
        })
    }

    fn delete_mailbox(&mut self, name: &str) -> Result<(), StoreError> {
        self.with_user(|data| {
            data.mailboxes
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| StoreError::NoSuchMailbox(name.to_owned()))
        })
    }

    fn rename_mailbox(&mut self, from: &str, to: &str) -> Result<(), StoreError> {
        self.with_user(|data| {
            if data.mailboxes.contains_key(to) {
                return Err(StoreError::MailboxExists(to.to_owned()));
            }
            let mailbox = data
                .mailboxes
                .remove(from)
                .ok_or_else(|| StoreError::NoSuchMailbox(from.to_owned()))?;
            data.mailboxes.insert(to.to_owned(), mailbox);
            Ok(())
        })
    }

    fn subscribe(&mut self, name: &str) -> Result<(), StoreError> {
        let name = name.to_owned();
        self.with_user(move |data| {
            data.subscriptions.insert(name);
            Ok(())
        })
    }

    fn unsubscribe(&mut self, name: &str) -> Result<(), StoreError> {
        self.with_user(|data| {
            data.subscriptions.remove(name);
            Ok(())
        })
    }

    fn list(&self, reference: &str, pattern: &str) -> Result<Vec<MailboxInfo>, StoreError> {
        self.with_user(|data| {
            let full_pattern = format!("{reference}{pattern}");
            let names: Vec<String> = data.mailboxes.keys().cloned().collect();
            Ok(names
                .iter()
                .filter(|name| pattern_match(full_pattern.as_bytes(), name.as_bytes(), b'/'))
                .map(|name| MailboxInfo {
                    name: name.clone(),
                    no_select: false,
                    has_children: names
                        .iter()
                        .any(|other| other.starts_with(&format!("{name}/"))),
                })
                .collect())
        })
    }

    fn list_subscribed(
        &self,
        reference: &str,
        pattern: &str,
    ) -> Result<Vec<MailboxInfo>, StoreError> {
        let all = self.list(reference, pattern)?;
        self.with_user(|data| {
            Ok(all
                .into_iter()
                .filter(|info| data.subscriptions.contains(&info.name))
                .collect())
        })
    }

    fn hierarchy_delimiter(&self) -> char {
        '/'
    }

    fn personal_namespace(&self) -> String {
        String::new()
    }

    fn mailbox_attributes(&self, name: &str) -> Result<MailboxAttributes, StoreError> {
        self.with_user(|data| {
            let mailbox = data
                .mailboxes
                .get(name)
                .ok_or_else(|| StoreError::NoSuchMailbox(name.to_owned()))?;
            Ok(MailboxAttributes {
                messages: mailbox.messages.len() as u32,
                unseen: mailbox
                    .messages
                    .iter()
                    .filter(|m| !m.flags.contains(&Flag::Seen))
                    .count() as u32,
                uid_validity: mailbox.uid_validity,
                uid_next: mailbox.uid_next,
                size: mailbox.messages.iter().map(|m| m.content.len() as u64).sum(),
            })
        })
    }

    fn close(&mut self) {}
}

/// `%` matches within one hierarchy level, `*` across levels.
fn pattern_match(pattern: &[u8], name: &[u8], delimiter: u8) -> bool {
    match pattern.first() {
        None => name.is_empty(),
        Some(b'*') => (0..=name.len())
            .any(|i| pattern_match(&pattern[1..], &name[i..], delimiter)),
        Some(b'%') => (0..=name.len())
            .filter(|i| !name[..*i].contains(&delimiter))
            .any(|i| pattern_match(&pattern[1..], &name[i..], delimiter)),
        Some(byte) => {
            name.first() == Some(byte) && pattern_match(&pattern[1..], &name[1..], delimiter)
        }
    }
}

struct PendingAppend {
    flags: Vec<Flag>,
    internal_date: Option<DateTime<FixedOffset>>,
    content: Vec<u8>,
}

pub struct MemoryMailbox {
    shared: Shared,
    user: String,
    name: String,
    read_only: bool,
    append: Option<PendingAppend>,
}

impl MemoryMailbox {
    fn with_mailbox<T>(
        &self,
        f: impl FnOnce(&mut MailboxData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut users = self.shared.lock().expect("store lock");
        let mailbox = users
            .get_mut(&self.user)
            .and_then(|data| data.mailboxes.get_mut(&self.name))
            .ok_or_else(|| StoreError::NoSuchMailbox(self.name.clone()))?;
        f(mailbox)
    }

    fn guard_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            Err(StoreError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

impl Mailbox for MemoryMailbox {
    fn name(&self) -> &str {
        &self.name
    }

    fn message_count(&self) -> u32 {
        self.with_mailbox(|mailbox| Ok(mailbox.messages.len() as u32))
            .unwrap_or(0)
    }

    fn mailbox_size(&self) -> u64 {
        self.with_mailbox(|mailbox| {
            Ok(mailbox.messages.iter().map(|m| m.content.len() as u64).sum())
        })
        .unwrap_or(0)
    }

    fn uid_validity(&self) -> u32 {
        self.with_mailbox(|mailbox| Ok(mailbox.uid_validity)).unwrap_or(0)
    }

    fn uid_next(&self) -> u32 {
        self.with_mailbox(|mailbox| Ok(mailbox.uid_next)).unwrap_or(0)
    }

    fn permanent_flags(&self) -> Vec<Flag> {
        vec![
            Flag::Seen,
            Flag::Answered,
            Flag::Flagged,
            Flag::Deleted,
            Flag::Draft,
        ]
    }

    fn is_deleted(&self, seq: u32) -> bool {
        self.with_mailbox(|mailbox| {
            Ok(mailbox
                .messages
                .get(seq as usize - 1)
                .is_some_and(|m| m.flags.contains(&Flag::Deleted)))
        })
        .unwrap_or(false)
    }

    fn delete_message(&mut self, seq: u32) -> Result<(), StoreError> {
        self.guard_writable()?;
        self.with_mailbox(|mailbox| {
            let message = mailbox
                .messages
                .get_mut(seq as usize - 1)
                .ok_or(StoreError::NoSuchMessage(seq))?;
            if !message.flags.contains(&Flag::Deleted) {
                message.flags.push(Flag::Deleted);
            }
            Ok(())
        })
    }

    fn undelete_all(&mut self) {
        let _ = self.with_mailbox(|mailbox| {
            for message in &mut mailbox.messages {
                message.flags.retain(|flag| *flag != Flag::Deleted);
            }
            Ok(())
        });
    }

    fn expunge(&mut self) -> Result<Vec<u32>, StoreError> {
        self.guard_writable()?;
        self.with_mailbox(|mailbox| {
            let mut removed = Vec::new();
            for (i, message) in mailbox.messages.iter().enumerate() {
                if message.flags.contains(&Flag::Deleted) {
                    removed.push(i as u32 + 1);
                }
            }
            mailbox
                .messages
                .retain(|message| !message.flags.contains(&Flag::Deleted));
            removed.reverse();
            Ok(removed)
        })
    }

    fn get_message(&self, seq: u32) -> Result<MessageMeta, StoreError> {
        self.with_mailbox(|mailbox| {
            mailbox
                .messages
                .get(seq as usize - 1)
                .map(|message| message.meta(seq))
                .ok_or(StoreError::NoSuchMessage(seq))
        })
    }

    fn get_message_content(&self, seq: u32) -> Result<Box<dyn Read + Send>, StoreError> {
        self.with_mailbox(|mailbox| {
            let message = mailbox
                .messages
                .get(seq as usize - 1)
                .ok_or(StoreError::NoSuchMessage(seq))?;
            Ok(Box::new(Cursor::new(message.content.clone())) as Box<dyn Read + Send>)
        })
    }

    fn get_message_top(&self, seq: u32, lines: u32) -> Result<Box<dyn Read + Send>, StoreError> {
        self.with_mailbox(|mailbox| {
            let message = mailbox
                .messages
                .get(seq as usize - 1)
                .ok_or(StoreError::NoSuchMessage(seq))?;

            let mut out = Vec::new();
            let mut body_lines = 0;
            let mut in_body = false;
            for line in message.content.split_inclusive(|b| *b == b'\n') {
                if in_body {
                    if body_lines >= lines {
                        break;
                    }
                    body_lines += 1;
                } else if line == b"\r\n" || line == b"\n" {
                    in_body = true;
                }
                out.extend_from_slice(line);
            }

            Ok(Box::new(Cursor::new(out)) as Box<dyn Read + Send>)
        })
    }

    fn get_unique_id(&self, seq: u32) -> Result<String, StoreError> {
        self.with_mailbox(|mailbox| {
            let message = mailbox
                .messages
                .get(seq as usize - 1)
                .ok_or(StoreError::NoSuchMessage(seq))?;
            Ok(format!("{}-{}", mailbox.uid_validity, message.uid))
        })
    }

    fn get_message_list(&self) -> Result<Vec<MessageMeta>, StoreError> {
        self.with_mailbox(|mailbox| {
            Ok(mailbox
                .messages
                .iter()
                .enumerate()
                .map(|(i, message)| message.meta(i as u32 + 1))
                .collect())
        })
    }

    fn search(&self, criteria: &SearchKey) -> Result<Vec<u32>, StoreError> {
        self.with_mailbox(|mailbox| {
            let total = mailbox.messages.len() as u32;
            let largest_uid = mailbox.messages.iter().map(|m| m.uid).max().unwrap_or(0);
            Ok(mailbox
                .messages
                .iter()
                .enumerate()
                .filter(|(i, message)| {
                    search_matches(criteria, message, *i as u32 + 1, total, largest_uid)
                })
                .map(|(i, _)| i as u32 + 1)
                .collect())
        })
    }

    fn store_flags(
        &mut self,
        seq: u32,
        op: FlagOp,
        flags: &[Flag],
    ) -> Result<Vec<Flag>, StoreError> {
        self.guard_writable()?;
        self.with_mailbox(|mailbox| {
            let message = mailbox
                .messages
                .get_mut(seq as usize - 1)
                .ok_or(StoreError::NoSuchMessage(seq))?;

            match op {
                FlagOp::Replace => {
                    message.flags = flags.to_vec();
                }
                FlagOp::Add => {
                    for flag in flags {
                        if !message.flags.contains(flag) {
                            message.flags.push(flag.clone());
                        }
                    }
                }
                FlagOp::Remove => {
                    message.flags.retain(|flag| !flags.contains(flag));
                }
            }

            Ok(message.flags.clone())
        })
    }

    fn start_append(
        &mut self,
        flags: &[Flag],
        internal_date: Option<DateTime<FixedOffset>>,
    ) -> Result<(), StoreError> {
        self.guard_writable()?;
        self.append = Some(PendingAppend {
            flags: flags.to_vec(),
            internal_date,
            content: Vec::new(),
        });
        Ok(())
    }

    fn append_content(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let append = self
            .append
            .as_mut()
            .ok_or_else(|| StoreError::Other("no append in progress".into()))?;
        append.content.extend_from_slice(bytes);
        Ok(())
    }

    fn end_append(&mut self) -> Result<u32, StoreError> {
        let append = self
            .append
            .take()
            .ok_or_else(|| StoreError::Other("no append in progress".into()))?;

        self.with_mailbox(|mailbox| {
            let uid = mailbox.uid_next;
            mailbox.uid_next += 1;

            let mut flags = append.flags.clone();
            if !flags.contains(&Flag::Recent) {
                flags.push(Flag::Recent);
            }
            mailbox.messages.push(StoredMessage {
                uid,
                flags,
                internal_date: append.internal_date.unwrap_or_else(epoch_date),
                content: append.content.clone(),
            });
            let count = mailbox.messages.len() as u32;
            mailbox.events.push(MailboxEvent::Exists(count));
            Ok(uid)
        })
    }

    fn abort_append(&mut self) {
        self.append = None;
    }

    fn drain_events(&mut self) -> Vec<MailboxEvent> {
        self.with_mailbox(|mailbox| Ok(std::mem::take(&mut mailbox.events)))
            .unwrap_or_default()
    }

    fn close(&mut self, expunge: bool) -> Result<(), StoreError> {
        self.append = None;
        if expunge && !self.read_only {
            self.expunge()?;
        }
        Ok(())
    }
}

fn search_matches(
    key: &SearchKey,
    message: &StoredMessage,
    seq: u32,
    total: u32,
    largest_uid: u32,
) -> bool {
    let has = |flag: &Flag| message.flags.contains(flag);
    let date = message.internal_date.date_naive();

    match key {
        SearchKey::And(keys) => keys
            .iter()
            .all(|key| search_matches(key, message, seq, total, largest_uid)),
        SearchKey::Or(a, b) => {
            search_matches(a, message, seq, total, largest_uid)
                || search_matches(b, message, seq, total, largest_uid)
        }
        SearchKey::Not(inner) => !search_matches(inner, message, seq, total, largest_uid),
        SearchKey::All => true,
        SearchKey::SequenceSet(set) => set.contains(seq, total),
        SearchKey::Uid(set) => set.contains(message.uid, largest_uid),
        SearchKey::Answered => has(&Flag::Answered),
        SearchKey::Unanswered => !has(&Flag::Answered),
        SearchKey::Deleted => has(&Flag::Deleted),
        SearchKey::Undeleted => !has(&Flag::Deleted),
        SearchKey::Draft => has(&Flag::Draft),
        SearchKey::Undraft => !has(&Flag::Draft),
        SearchKey::Flagged => has(&Flag::Flagged),
        SearchKey::Unflagged => !has(&Flag::Flagged),
        SearchKey::Seen => has(&Flag::Seen),
        SearchKey::Unseen => !has(&Flag::Seen),
        SearchKey::Recent => has(&Flag::Recent),
        SearchKey::Old => !has(&Flag::Recent),
        SearchKey::New => has(&Flag::Recent) && !has(&Flag::Seen),
        SearchKey::Keyword(word) => has(&Flag::Keyword(word.clone())),
        SearchKey::Unkeyword(word) => !has(&Flag::Keyword(word.clone())),
        SearchKey::Larger(n) => message.content.len() as u32 > *n,
        SearchKey::Smaller(n) => (message.content.len() as u32) < *n,
        SearchKey::Before(d) => date < *d,
        SearchKey::On(d) => date == *d,
        SearchKey::Since(d) => date >= *d,
        // The memory store keeps no separate sent date.
        SearchKey::SentBefore(d) => date < *d,
        SearchKey::SentOn(d) => date == *d,
        SearchKey::SentSince(d) => date >= *d,
        SearchKey::Body(needle) => {
            content_contains(body_of(&message.content), needle)
        }
        SearchKey::Text(needle) => content_contains(&message.content, needle),
        SearchKey::Subject(needle) => header_contains(&message.content, "Subject", needle),
        SearchKey::From(needle) => header_contains(&message.content, "From", needle),
        SearchKey::To(needle) => header_contains(&message.content, "To", needle),
        SearchKey::Cc(needle) => header_contains(&message.content, "Cc", needle),
        SearchKey::Bcc(needle) => header_contains(&message.content, "Bcc", needle),
        SearchKey::Header(field, needle) => header_contains(&message.content, field, needle),
    }
}

fn body_of(content: &[u8]) -> &[u8] {
    let mut offset = 0;
    for line in content.split_inclusive(|b| *b == b'\n') {
        offset += line.len();
        if line == b"\r\n" || line == b"\n" {
            return &content[offset..];
        }
    }
    content
}

fn content_contains(content: &[u8], needle: &str) -> bool {
    let haystack = String::from_utf8_lossy(content).to_ascii_lowercase();
    haystack.contains(&needle.to_ascii_lowercase())
}

fn header_contains(content: &[u8], field: &str, needle: &str) -> bool {
    let prefix = format!("{}:", field.to_ascii_lowercase());
    for line in content.split(|b| *b == b'\n') {
        let line = String::from_utf8_lossy(line);
        if line.trim().is_empty() {
            break;
        }
        let lower = line.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix(&prefix) {
            if value.contains(&needle.to_ascii_lowercase()) {
                return true;
            }
        }
    }
    false
}

// --- Quota ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct QuotaEntry {
    storage_used: u64,
    storage_limit: Option<u64>,
    message_count: u64,
    message_limit: Option<u64>,
}

/// A quota manager backed by per-user counters.
#[derive(Default)]
pub struct MemoryQuota {
    entries: Mutex<HashMap<String, QuotaEntry>>,
}

impl MemoryQuota {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_limits(&self, user: &str, storage: Option<u64>, messages: Option<u64>) {
        let mut entries = self.entries.lock().expect("quota lock");
        let entry = entries.entry(user.to_owned()).or_default();
        entry.storage_limit = storage;
        entry.message_limit = messages;
    }
}

impl QuotaManager for MemoryQuota {
    fn can_store(&self, user: &str, bytes: u64) -> bool {
        let entries = self.entries.lock().expect("quota lock");
        let Some(entry) = entries.get(user) else {
            return true;
        };

        let storage_ok = entry
            .storage_limit
            .map(|limit| entry.storage_used + bytes <= limit)
            .unwrap_or(true);
        let messages_ok = entry
            .message_limit
            .map(|limit| entry.message_count < limit)
            .unwrap_or(true);

        storage_ok && messages_ok
    }

    fn record_message_added(&self, user: &str, bytes: u64) {
        let mut entries = self.entries.lock().expect("quota lock");
        let entry = entries.entry(user.to_owned()).or_default();
        entry.storage_used += bytes;
        entry.message_count += 1;
    }

    fn get_quota(&self, user: &str) -> Quota {
        let entries = self.entries.lock().expect("quota lock");
        let entry = entries.get(user).copied().unwrap_or_default();
        Quota {
            storage_used: entry.storage_used,
            storage_limit: entry.storage_limit,
            message_count: entry.message_count,
            message_limit: entry.message_limit,
        }
    }

    fn set_user_quota(&self, user: &str, storage_limit: Option<u64>, message_limit: Option<u64>) {
        self.set_limits(user, storage_limit, message_limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_match(b"*", b"INBOX", b'/'));
        assert!(pattern_match(b"INBOX", b"INBOX", b'/'));
        assert!(pattern_match(b"Work/*", b"Work/2024/Q1", b'/'));
        assert!(pattern_match(b"Work/%", b"Work/2024", b'/'));
        assert!(!pattern_match(b"Work/%", b"Work/2024/Q1", b'/'));
        assert!(!pattern_match(b"%", b"Work/2024", b'/'));
    }

    #[test]
    fn test_store_round_trip() {
        let store = MemoryStore::new();
        store.add_user("alice");
        store.add_message("alice", "INBOX", b"Subject: hi\r\n\r\nhello\r\n");

        let mut user_store = store.open("alice").unwrap();
        let mailbox = user_store.open_mailbox("INBOX", false).unwrap();
        assert_eq!(mailbox.message_count(), 1);

        let meta = mailbox.get_message(1).unwrap();
        assert_eq!(meta.uid, 1);
        assert_eq!(meta.size, b"Subject: hi\r\n\r\nhello\r\n".len() as u64);
    }

    #[test]
    fn test_expunge_renumbers() {
        let store = MemoryStore::new();
        store.add_user("alice");
        for i in 0..3 {
            store.add_message("alice", "INBOX", format!("msg {i}\r\n").as_bytes());
        }

        let mut user_store = store.open("alice").unwrap();
        let mut mailbox = user_store.open_mailbox("INBOX", false).unwrap();
        mailbox.delete_message(2).unwrap();
        assert_eq!(mailbox.expunge().unwrap(), vec![2]);
        assert_eq!(mailbox.message_count(), 2);
    }

    #[test]
    fn test_search_by_flag_and_text() {
        let store = MemoryStore::new();
        store.add_user("alice");
        store.add_message("alice", "INBOX", b"Subject: groceries\r\n\r\nbuy milk\r\n");
        store.add_message("alice", "INBOX", b"Subject: work\r\n\r\nship the release\r\n");

        let mut user_store = store.open("alice").unwrap();
        let mut mailbox = user_store.open_mailbox("INBOX", false).unwrap();
        mailbox.store_flags(1, FlagOp::Add, &[Flag::Seen]).unwrap();

        assert_eq!(mailbox.search(&SearchKey::Seen).unwrap(), vec![1]);
        assert_eq!(mailbox.search(&SearchKey::Unseen).unwrap(), vec![2]);
        assert_eq!(
            mailbox
                .search(&SearchKey::Subject("work".into()))
                .unwrap(),
            vec![2]
        );
        assert_eq!(
            mailbox.search(&SearchKey::Body("milk".into())).unwrap(),
            vec![1]
        );
    }

    #[test]
    fn test_quota_enforcement() {
        let quota = MemoryQuota::new();
        quota.set_limits("alice", Some(100), None);

        assert!(quota.can_store("alice", 80));
        quota.record_message_added("alice", 80);
        assert!(!quota.can_store("alice", 30));
        assert!(quota.can_store("bob", 1 << 30));
    }
}
