//! The SASL continuation engine.
//!
//! Both carrier protocols (IMAP `AUTHENTICATE`, POP3 `AUTH`) drive the same
//! sub-state machine: the carrier decodes base64 continuation lines, hands
//! the raw payload to [`SaslSession::respond`], and maps the returned
//! [`SaslOutcome`] onto its own wire syntax. A client line consisting of a
//! single `*` aborts the exchange; the carrier handles that before calling
//! in here and simply drops the session.
//!
//! Scratch state (challenges, nonces, partial credentials) is overwritten
//! with zeros whenever the engine leaves a sub-state, including on drop.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{Rng, RngCore};
use thiserror::Error;

use crate::{
    error::RealmError,
    realm::{Lookup, Realm, ScramCredentials},
};

pub mod digest_md5;
pub mod mechanism;
pub mod ntlm;
pub mod scram;

pub use mechanism::{Mechanism, UnknownMechanism, ALL_MECHANISMS};

/// A successfully authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub principal: String,
    pub mechanism: Mechanism,
}

/// What the carrier must do next.
#[derive(Debug)]
pub enum SaslOutcome {
    /// Send a continuation carrying this payload (raw; the carrier
    /// base64-encodes it) and feed the next client line back in.
    Proceed(Vec<u8>),
    Success(Authenticated),
    Failure(SaslFailure),
}

#[derive(Debug, Error)]
pub enum SaslFailure {
    #[error("authentication failed")]
    BadCredentials,

    #[error("{0} is not supported")]
    Unsupported(Mechanism),

    #[error("{0} requires an encrypted connection")]
    PrivacyRequired(Mechanism),

    #[error("malformed client response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Realm(#[from] RealmError),
}

/// What the engine may observe about the transport while negotiating.
#[derive(Debug, Clone, Default)]
pub struct ChannelView {
    pub secure: bool,
    pub allow_plaintext: bool,
    /// Subject common name of the peer certificate, for EXTERNAL.
    pub peer_common_name: Option<String>,
}

enum State {
    PlainResponse,
    LoginUsername,
    LoginPassword { username: String },
    CramMd5Response { challenge: String },
    DigestMd5Response { nonce: String },
    ScramInitial,
    ScramFinal { scratch: scram::ScramScratch, credentials: ScramCredentials },
    /// Server-final sent; waiting for the client's empty acknowledgement.
    ScramVerify { principal: String },
    OAuthResponse,
    ExternalResponse,
    NtlmType1,
    NtlmType3 { challenge: [u8; 8] },
    Done,
}

impl State {
    /// Overwrite whatever secret material this state holds.
    fn wipe(&mut self) {
        match self {
            State::LoginPassword { username } => wipe_string(username),
            State::CramMd5Response { challenge } => wipe_string(challenge),
            State::DigestMd5Response { nonce } => wipe_string(nonce),
            State::ScramFinal { scratch, credentials } => {
                scratch.wipe();
                credentials.stored_key.fill(0);
                credentials.server_key.fill(0);
            }
            State::NtlmType3 { challenge } => challenge.fill(0),
            _ => {}
        }
    }
}

fn wipe_string(s: &mut String) {
    let mut bytes = std::mem::take(s).into_bytes();
    bytes.fill(0);
}

/// One in-flight authentication exchange.
pub struct SaslSession {
    mechanism: Mechanism,
    host: String,
    state: State,
}

impl Drop for SaslSession {
    fn drop(&mut self) {
        self.state.wipe();
    }
}

impl SaslSession {
    /// Begin an exchange. The returned outcome is the server's first move;
    /// the session is only needed further when it is `Proceed`.
    pub fn start(
        mechanism: Mechanism,
        initial: Option<&[u8]>,
        realm: &dyn Realm,
        channel: &ChannelView,
        host: &str,
    ) -> (Self, SaslOutcome) {
        let mut session = Self {
            mechanism,
            host: host.to_owned(),
            state: State::Done,
        };

        if mechanism.requires_tls(channel.allow_plaintext) && !channel.secure {
            return (
                session,
                SaslOutcome::Failure(SaslFailure::PrivacyRequired(mechanism)),
            );
        }
        if !realm.sasl_mechanisms().contains(&mechanism) {
            return (
                session,
                SaslOutcome::Failure(SaslFailure::Unsupported(mechanism)),
            );
        }

        let outcome = match mechanism {
            Mechanism::Plain => match initial {
                Some(data) => session.plain(data, realm),
                None => session.advance(State::PlainResponse, Vec::new()),
            },
            Mechanism::Login => match initial {
                Some(data) => session.login_username(data),
                None => session.advance(State::LoginUsername, b"Username:".to_vec()),
            },
            Mechanism::CramMd5 => {
                let challenge = session.fresh_challenge();
                let payload = challenge.clone().into_bytes();
                session.advance(State::CramMd5Response { challenge }, payload)
            }
            Mechanism::DigestMd5 => {
                let nonce = BASE64.encode(random_bytes(30));
                let payload = digest_md5::challenge(&session.host, &nonce).into_bytes();
                session.advance(State::DigestMd5Response { nonce }, payload)
            }
            Mechanism::ScramSha256 => match initial {
                Some(data) => session.scram_first(data, realm),
                None => session.advance(State::ScramInitial, Vec::new()),
            },
            Mechanism::OAuthBearer => match initial {
                Some(data) => session.oauth(data, realm),
                None => session.advance(State::OAuthResponse, Vec::new()),
            },
            Mechanism::External => match initial {
                Some(data) => session.external(data, realm, channel),
                None => session.advance(State::ExternalResponse, Vec::new()),
            },
            Mechanism::Ntlm => match initial {
                Some(data) => session.ntlm_negotiate(data),
                None => session.advance(State::NtlmType1, Vec::new()),
            },
        };

        (session, outcome)
    }

    /// Feed one decoded continuation payload in.
    pub fn respond(
        &mut self,
        data: &[u8],
        realm: &dyn Realm,
        channel: &ChannelView,
    ) -> SaslOutcome {
        let state = std::mem::replace(&mut self.state, State::Done);

        match state {
            State::PlainResponse => self.plain(data, realm),
            State::LoginUsername => self.login_username(data),
            State::LoginPassword { mut username } => {
                let outcome = self.login_password(&username, data, realm);
                wipe_string(&mut username);
                outcome
            }
            State::CramMd5Response { mut challenge } => {
                let outcome = self.cram_md5(&challenge, data, realm);
                wipe_string(&mut challenge);
                outcome
            }
            State::DigestMd5Response { mut nonce } => {
                let outcome = self.digest_md5(&nonce, data, realm);
                wipe_string(&mut nonce);
                outcome
            }
            State::ScramInitial => self.scram_first(data, realm),
            State::ScramFinal {
                mut scratch,
                mut credentials,
            } => {
                let outcome = self.scram_final(&scratch, &credentials, data);
                scratch.wipe();
                credentials.stored_key.fill(0);
                credentials.server_key.fill(0);
                outcome
            }
            State::ScramVerify { principal } => self.success(principal),
            State::OAuthResponse => self.oauth(data, realm),
            State::ExternalResponse => self.external(data, realm, channel),
            State::NtlmType1 => self.ntlm_negotiate(data),
            State::NtlmType3 { mut challenge } => {
                let outcome = self.ntlm_authenticate(data, realm);
                challenge.fill(0);
                outcome
            }
            State::Done => SaslOutcome::Failure(SaslFailure::Malformed(
                "continuation after exchange ended".into(),
            )),
        }
    }

    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    fn advance(&mut self, next: State, payload: Vec<u8>) -> SaslOutcome {
        self.state.wipe();
        self.state = next;
        SaslOutcome::Proceed(payload)
    }

    fn success(&mut self, principal: String) -> SaslOutcome {
        self.state.wipe();
        self.state = State::Done;
        SaslOutcome::Success(Authenticated {
            principal,
            mechanism: self.mechanism,
        })
    }

    fn fail(&mut self, failure: SaslFailure) -> SaslOutcome {
        self.state.wipe();
        self.state = State::Done;
        SaslOutcome::Failure(failure)
    }

    fn fresh_challenge(&self) -> String {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!(
            "<{}.{}@{}>",
            rand::thread_rng().gen::<u32>(),
            epoch,
            self.host
        )
    }

    // --- PLAIN -----------------------------------------------------------

    fn plain(&mut self, data: &[u8], realm: &dyn Realm) -> SaslOutcome {
        let mut parts = data.splitn(3, |byte| *byte == 0);
        let (authzid, authcid, password) = match (parts.next(), parts.next(), parts.next()) {
            (Some(z), Some(c), Some(p)) => (z, c, p),
            _ => return self.fail(SaslFailure::Malformed("PLAIN needs two NULs".into())),
        };

        let authcid = match std::str::from_utf8(authcid) {
            Ok(s) if !s.is_empty() => s.to_owned(),
            _ => return self.fail(SaslFailure::Malformed("bad authentication identity".into())),
        };
        let password = match std::str::from_utf8(password) {
            Ok(s) => s.to_owned(),
            Err(_) => return self.fail(SaslFailure::Malformed("password is not UTF-8".into())),
        };

        // Proxy authorization is not offered.
        if !authzid.is_empty() && authzid != authcid.as_bytes() {
            return self.fail(SaslFailure::BadCredentials);
        }

        match realm.password_match(&authcid, &password) {
            Ok(true) => self.success(authcid),
            Ok(false) => self.fail(SaslFailure::BadCredentials),
            Err(error) => self.fail(error.into()),
        }
    }

    // --- LOGIN -----------------------------------------------------------

    fn login_username(&mut self, data: &[u8]) -> SaslOutcome {
        match std::str::from_utf8(data) {
            Ok(username) if !username.is_empty() => self.advance(
                State::LoginPassword {
                    username: username.to_owned(),
                },
                b"Password:".to_vec(),
            ),
            _ => self.fail(SaslFailure::Malformed("bad username".into())),
        }
    }

    fn login_password(&mut self, username: &str, data: &[u8], realm: &dyn Realm) -> SaslOutcome {
        let password = match std::str::from_utf8(data) {
            Ok(s) => s,
            Err(_) => return self.fail(SaslFailure::Malformed("password is not UTF-8".into())),
        };

        match realm.password_match(username, password) {
            Ok(true) => self.success(username.to_owned()),
            Ok(false) => self.fail(SaslFailure::BadCredentials),
            Err(error) => self.fail(error.into()),
        }
    }

    // --- CRAM-MD5 --------------------------------------------------------

    fn cram_md5(&mut self, challenge: &str, data: &[u8], realm: &dyn Realm) -> SaslOutcome {
        let text = match std::str::from_utf8(data) {
            Ok(s) => s,
            Err(_) => return self.fail(SaslFailure::Malformed("response is not UTF-8".into())),
        };
        let (username, digest) = match text.rsplit_once(' ') {
            Some(parts) => parts,
            None => return self.fail(SaslFailure::Malformed("expected `user digest`".into())),
        };

        match realm.cram_md5_response(username, challenge) {
            Ok(Lookup::Found(expected)) if expected.eq_ignore_ascii_case(digest) => {
                self.success(username.to_owned())
            }
            Ok(Lookup::Found(_) | Lookup::NoSuchUser) => self.fail(SaslFailure::BadCredentials),
            Ok(Lookup::Unsupported) => self.fail(SaslFailure::Unsupported(Mechanism::CramMd5)),
            Err(error) => self.fail(error.into()),
        }
    }

    // --- DIGEST-MD5 ------------------------------------------------------

    fn digest_md5(&mut self, nonce: &str, data: &[u8], realm: &dyn Realm) -> SaslOutcome {
        let text = match std::str::from_utf8(data) {
            Ok(s) => s,
            Err(_) => return self.fail(SaslFailure::Malformed("response is not UTF-8".into())),
        };
        let parsed = match digest_md5::parse_response(text) {
            Ok(parsed) => parsed,
            Err(error) => return self.fail(SaslFailure::Malformed(error.to_string())),
        };

        let ha1 = match realm.digest_ha1(&parsed.username, &parsed.realm) {
            Ok(Lookup::Found(ha1)) => ha1,
            Ok(Lookup::NoSuchUser) => return self.fail(SaslFailure::BadCredentials),
            Ok(Lookup::Unsupported) => {
                return self.fail(SaslFailure::Unsupported(Mechanism::DigestMd5))
            }
            Err(error) => return self.fail(error.into()),
        };

        match digest_md5::verify(&parsed, &ha1, nonce) {
            Ok(true) => self.success(parsed.username),
            Ok(false) => self.fail(SaslFailure::BadCredentials),
            Err(error) => self.fail(SaslFailure::Malformed(error.to_string())),
        }
    }

    // --- SCRAM-SHA-256 ---------------------------------------------------

    fn scram_first(&mut self, data: &[u8], realm: &dyn Realm) -> SaslOutcome {
        let text = match std::str::from_utf8(data) {
            Ok(s) => s,
            Err(_) => return self.fail(SaslFailure::Malformed("client-first is not UTF-8".into())),
        };
        let first = match scram::parse_client_first(text) {
            Ok(first) => first,
            Err(error) => return self.fail(SaslFailure::Malformed(error.to_string())),
        };

        let credentials = match realm.scram_credentials(&first.username) {
            Ok(Lookup::Found(credentials)) => credentials,
            Ok(Lookup::NoSuchUser) => return self.fail(SaslFailure::BadCredentials),
            Ok(Lookup::Unsupported) => {
                return self.fail(SaslFailure::Unsupported(Mechanism::ScramSha256))
            }
            Err(error) => return self.fail(error.into()),
        };

        let full_nonce = format!("{}{}", first.client_nonce, BASE64.encode(random_bytes(18)));
        let server_first =
            scram::server_first(&full_nonce, &credentials.salt, credentials.iterations);

        let scratch = scram::ScramScratch {
            username: first.username,
            client_first_bare: first.bare,
            server_first: server_first.clone(),
            full_nonce,
            stored_key: credentials.stored_key.clone(),
            server_key: credentials.server_key.clone(),
        };

        self.advance(
            State::ScramFinal {
                scratch,
                credentials,
            },
            server_first.into_bytes(),
        )
    }

    fn scram_final(
        &mut self,
        scratch: &scram::ScramScratch,
        credentials: &ScramCredentials,
        data: &[u8],
    ) -> SaslOutcome {
        let text = match std::str::from_utf8(data) {
            Ok(s) => s,
            Err(_) => return self.fail(SaslFailure::Malformed("client-final is not UTF-8".into())),
        };

        match scram::verify_client_final(scratch, credentials, text) {
            Ok(server_final) => {
                let principal = scratch.username.clone();
                self.advance(State::ScramVerify { principal }, server_final.into_bytes())
            }
            Err(scram::ScramError::BadProof) => self.fail(SaslFailure::BadCredentials),
            Err(error) => self.fail(SaslFailure::Malformed(error.to_string())),
        }
    }

    // --- OAUTHBEARER -----------------------------------------------------

    fn oauth(&mut self, data: &[u8], realm: &dyn Realm) -> SaslOutcome {
        let text = match std::str::from_utf8(data) {
            Ok(s) => s,
            Err(_) => return self.fail(SaslFailure::Malformed("response is not UTF-8".into())),
        };

        // GS2 header, then ^A-separated key=value pairs, double ^A at the end.
        let token = text.split('\u{1}').find_map(|field| {
            field
                .strip_prefix("auth=")
                .and_then(|auth| auth.strip_prefix("Bearer "))
        });
        let token = match token {
            Some(token) if !token.is_empty() => token,
            _ => return self.fail(SaslFailure::Malformed("missing Bearer token".into())),
        };

        match realm.validate_bearer_token(token) {
            Ok(Lookup::Found(principal)) => self.success(principal),
            Ok(Lookup::NoSuchUser) => self.fail(SaslFailure::BadCredentials),
            Ok(Lookup::Unsupported) => self.fail(SaslFailure::Unsupported(Mechanism::OAuthBearer)),
            Err(error) => self.fail(error.into()),
        }
    }

    // --- EXTERNAL --------------------------------------------------------

    fn external(&mut self, data: &[u8], realm: &dyn Realm, channel: &ChannelView) -> SaslOutcome {
        let authzid = match std::str::from_utf8(data) {
            Ok(s) => s,
            Err(_) => return self.fail(SaslFailure::Malformed("authzid is not UTF-8".into())),
        };

        let principal = if !authzid.is_empty() {
            authzid.to_owned()
        } else {
            match &channel.peer_common_name {
                Some(cn) => cn.clone(),
                None => return self.fail(SaslFailure::BadCredentials),
            }
        };

        match realm.user_exists(&principal) {
            Ok(true) => self.success(principal),
            Ok(false) => self.fail(SaslFailure::BadCredentials),
            Err(error) => self.fail(error.into()),
        }
    }

    // --- NTLM ------------------------------------------------------------

    fn ntlm_negotiate(&mut self, data: &[u8]) -> SaslOutcome {
        let flags = match ntlm::parse_type1(data) {
            Ok(flags) => flags,
            Err(error) => return self.fail(SaslFailure::Malformed(error.to_string())),
        };

        let mut challenge = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut challenge);
        let payload = ntlm::type2(&challenge, flags);

        self.advance(State::NtlmType3 { challenge }, payload)
    }

    fn ntlm_authenticate(&mut self, data: &[u8], realm: &dyn Realm) -> SaslOutcome {
        let username = match ntlm::parse_type3_username(data) {
            Ok(username) => username,
            Err(error) => return self.fail(SaslFailure::Malformed(error.to_string())),
        };

        match realm.user_exists(&username) {
            Ok(true) => self.success(username),
            Ok(false) => self.fail(SaslFailure::BadCredentials),
            Err(error) => self.fail(error.into()),
        }
    }
}

fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryRealm;

    fn secure_channel() -> ChannelView {
        ChannelView {
            secure: true,
            allow_plaintext: false,
            peer_common_name: None,
        }
    }

    fn realm() -> MemoryRealm {
        let mut realm = MemoryRealm::new();
        realm.add_user("alice", "s3cret");
        realm
    }

    #[test]
    fn test_plain_with_initial_response() {
        let realm = realm();
        let (_, outcome) = SaslSession::start(
            Mechanism::Plain,
            Some(b"\0alice\0s3cret"),
            &realm,
            &secure_channel(),
            "mail.example.org",
        );

        match outcome {
            SaslOutcome::Success(auth) => {
                assert_eq!(auth.principal, "alice");
                assert_eq!(auth.mechanism, Mechanism::Plain);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_bad_password() {
        let realm = realm();
        let (_, outcome) = SaslSession::start(
            Mechanism::Plain,
            Some(b"\0alice\0wrong"),
            &realm,
            &secure_channel(),
            "mail.example.org",
        );

        assert!(matches!(
            outcome,
            SaslOutcome::Failure(SaslFailure::BadCredentials)
        ));
    }

    #[test]
    fn test_plain_refused_on_insecure_channel() {
        let realm = realm();
        let channel = ChannelView::default();
        let (_, outcome) = SaslSession::start(
            Mechanism::Plain,
            Some(b"\0alice\0s3cret"),
            &realm,
            &channel,
            "mail.example.org",
        );

        assert!(matches!(
            outcome,
            SaslOutcome::Failure(SaslFailure::PrivacyRequired(Mechanism::Plain))
        ));
    }

    #[test]
    fn test_login_two_steps() {
        let realm = realm();
        let (mut session, outcome) = SaslSession::start(
            Mechanism::Login,
            None,
            &realm,
            &secure_channel(),
            "mail.example.org",
        );

        match outcome {
            SaslOutcome::Proceed(prompt) => assert_eq!(prompt, b"Username:"),
            other => panic!("expected username prompt, got {other:?}"),
        }

        match session.respond(b"alice", &realm, &secure_channel()) {
            SaslOutcome::Proceed(prompt) => assert_eq!(prompt, b"Password:"),
            other => panic!("expected password prompt, got {other:?}"),
        }

        match session.respond(b"s3cret", &realm, &secure_channel()) {
            SaslOutcome::Success(auth) => assert_eq!(auth.principal, "alice"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_cram_md5_round_trip() {
        let realm = realm();
        let channel = ChannelView::default();
        let (mut session, outcome) = SaslSession::start(
            Mechanism::CramMd5,
            None,
            &realm,
            &channel,
            "mail.example.org",
        );

        let challenge = match outcome {
            SaslOutcome::Proceed(challenge) => String::from_utf8(challenge).unwrap(),
            other => panic!("expected challenge, got {other:?}"),
        };
        assert!(challenge.starts_with('<') && challenge.ends_with('>'));

        let digest = MemoryRealm::hmac_md5_hex("s3cret", &challenge);
        let response = format!("alice {digest}");

        match session.respond(response.as_bytes(), &realm, &channel) {
            SaslOutcome::Success(auth) => assert_eq!(auth.principal, "alice"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_scram_full_exchange() {
        let realm = realm();
        let channel = ChannelView::default();
        let (mut session, outcome) = SaslSession::start(
            Mechanism::ScramSha256,
            Some(b"n,,n=alice,r=clientnonce"),
            &realm,
            &channel,
            "mail.example.org",
        );

        let server_first = match outcome {
            SaslOutcome::Proceed(payload) => String::from_utf8(payload).unwrap(),
            other => panic!("expected server-first, got {other:?}"),
        };

        let client_final =
            MemoryRealm::scram_client_final("s3cret", "n=alice,r=clientnonce", &server_first);

        let server_final = match session.respond(client_final.as_bytes(), &realm, &channel) {
            SaslOutcome::Proceed(payload) => String::from_utf8(payload).unwrap(),
            other => panic!("expected server-final, got {other:?}"),
        };
        assert!(server_final.starts_with("v="));

        match session.respond(b"", &realm, &channel) {
            SaslOutcome::Success(auth) => assert_eq!(auth.principal, "alice"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_scram_wrong_password() {
        let realm = realm();
        let channel = ChannelView::default();
        let (mut session, outcome) = SaslSession::start(
            Mechanism::ScramSha256,
            Some(b"n,,n=alice,r=clientnonce"),
            &realm,
            &channel,
            "mail.example.org",
        );

        let server_first = match outcome {
            SaslOutcome::Proceed(payload) => String::from_utf8(payload).unwrap(),
            other => panic!("expected server-first, got {other:?}"),
        };

        let client_final =
            MemoryRealm::scram_client_final("wrong", "n=alice,r=clientnonce", &server_first);

        assert!(matches!(
            session.respond(client_final.as_bytes(), &realm, &channel),
            SaslOutcome::Failure(SaslFailure::BadCredentials)
        ));
    }

    #[test]
    fn test_oauthbearer() {
        let mut realm = realm();
        realm.add_bearer_token("tok-123", "alice");
        let (_, outcome) = SaslSession::start(
            Mechanism::OAuthBearer,
            Some(b"n,a=alice,\x01host=mail.example.org\x01auth=Bearer tok-123\x01\x01"),
            &realm,
            &secure_channel(),
            "mail.example.org",
        );

        match outcome {
            SaslOutcome::Success(auth) => assert_eq!(auth.principal, "alice"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_external_uses_peer_certificate() {
        let realm = realm();
        let channel = ChannelView {
            secure: true,
            allow_plaintext: false,
            peer_common_name: Some("alice".into()),
        };

        let (_, outcome) = SaslSession::start(
            Mechanism::External,
            Some(b""),
            &realm,
            &channel,
            "mail.example.org",
        );

        match outcome {
            SaslOutcome::Success(auth) => assert_eq!(auth.principal, "alice"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_ntlm_exchange() {
        let realm = realm();
        let channel = ChannelView::default();

        let mut type1 = Vec::new();
        type1.extend_from_slice(b"NTLMSSP\0");
        type1.extend_from_slice(&1u32.to_le_bytes());
        type1.extend_from_slice(&1u32.to_le_bytes());

        let (mut session, outcome) = SaslSession::start(
            Mechanism::Ntlm,
            Some(&type1),
            &realm,
            &channel,
            "mail.example.org",
        );

        match outcome {
            SaslOutcome::Proceed(type2) => assert_eq!(&type2[..8], b"NTLMSSP\0"),
            other => panic!("expected type2 challenge, got {other:?}"),
        }

        let mut type3 = Vec::new();
        type3.extend_from_slice(b"NTLMSSP\0");
        type3.extend_from_slice(&3u32.to_le_bytes());
        for _ in 0..3 {
            type3.extend_from_slice(&[0u8; 8]);
        }
        let name: Vec<u8> = "alice"
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        type3.extend_from_slice(&(name.len() as u16).to_le_bytes());
        type3.extend_from_slice(&(name.len() as u16).to_le_bytes());
        type3.extend_from_slice(&64u32.to_le_bytes());
        for _ in 0..2 {
            type3.extend_from_slice(&[0u8; 8]);
        }
        type3.extend_from_slice(&0u32.to_le_bytes());
        type3.extend_from_slice(&name);

        match session.respond(&type3, &realm, &channel) {
            SaslOutcome::Success(auth) => assert_eq!(auth.principal, "alice"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_user_is_bad_credentials() {
        let realm = realm();
        let (_, outcome) = SaslSession::start(
            Mechanism::Plain,
            Some(b"\0mallory\0whatever"),
            &realm,
            &secure_channel(),
            "mail.example.org",
        );

        assert!(matches!(
            outcome,
            SaslOutcome::Failure(SaslFailure::BadCredentials)
        ));
    }
}
