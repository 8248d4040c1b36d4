//! POP3 session scenarios driven through the in-memory endpoint.

use std::sync::Arc;

use mailgate::{
    endpoint::{BufferedEndpoint, SecurityInfo},
    pop3::{Pop3Context, Pop3Session},
    testing::{MemoryRealm, MemoryStore},
    Pop3Config,
};

struct Fixture {
    session: Pop3Session<BufferedEndpoint>,
    store: MemoryStore,
    ctx: Arc<Pop3Context>,
}

fn fixture_with(configure: impl FnOnce(&mut Pop3Config)) -> Fixture {
    let mut realm = MemoryRealm::new();
    realm.add_user("bob", "hunter2");

    let store = MemoryStore::new();
    store.add_user("bob");
    store.add_message("bob", "INBOX", b"Subject: a\r\n\r\nfirst\r\n");
    store.add_message("bob", "INBOX", b"Subject: b\r\n\r\nsecond\r\n");
    store.add_message(
        "bob",
        "INBOX",
        b"Subject: dots\r\n\r\n.single dot line\r\nplain line\r\n",
    );

    let mut config = Pop3Config {
        host_name: "mail.example.org".into(),
        allow_plaintext: true,
        ..Pop3Config::default()
    };
    configure(&mut config);

    let ctx = Arc::new(Pop3Context {
        config,
        realm: Arc::new(realm),
        store: Arc::new(store.clone()),
        tls_available: true,
    });

    Fixture {
        session: Pop3Session::new(Arc::clone(&ctx), BufferedEndpoint::detached()),
        store,
        ctx,
    }
}

fn fixture() -> Fixture {
    fixture_with(|_| {})
}

/// A second session against the same store, as a reconnecting client.
fn reconnect(fx: &Fixture) -> Pop3Session<BufferedEndpoint> {
    Pop3Session::new(Arc::clone(&fx.ctx), BufferedEndpoint::detached())
}

fn send(session: &mut Pop3Session<BufferedEndpoint>, line: &str) -> String {
    session
        .receive(format!("{line}\r\n").as_bytes())
        .expect("connection stays alive");
    output(session)
}

fn output(session: &mut Pop3Session<BufferedEndpoint>) -> String {
    String::from_utf8(session.endpoint_mut().take_output()).expect("responses are UTF-8")
}

fn greet(session: &mut Pop3Session<BufferedEndpoint>) -> String {
    session.greet();
    output(session)
}

fn login(session: &mut Pop3Session<BufferedEndpoint>) {
    greet(session);
    let reply = send(session, "USER bob");
    assert!(reply.starts_with("+OK"), "{reply}");
    let reply = send(session, "PASS hunter2");
    assert!(reply.starts_with("+OK"), "{reply}");
}

#[test]
fn greeting_carries_apop_timestamp() {
    let mut fx = fixture();
    let greeting = greet(&mut fx.session);

    assert!(greeting.starts_with("+OK mail.example.org POP3 server ready <"), "{greeting}");
    let timestamp = &greeting[greeting.find('<').unwrap()..greeting.rfind('>').unwrap() + 1];
    assert!(timestamp.contains('.'), "{timestamp}");
    assert!(timestamp.contains("@mail.example.org"), "{timestamp}");
}

#[test]
fn apop_authenticates_with_md5_digest() {
    let mut fx = fixture();
    let greeting = greet(&mut fx.session);
    let timestamp =
        &greeting[greeting.find('<').unwrap()..greeting.rfind('>').unwrap() + 1];

    let digest = MemoryRealm::apop_digest(timestamp, "hunter2");
    let reply = send(&mut fx.session, &format!("APOP bob {digest}"));
    assert!(reply.starts_with("+OK"), "{reply}");

    // TRANSACTION state reached.
    let reply = send(&mut fx.session, "STAT");
    assert!(reply.starts_with("+OK 3 "), "{reply}");
}

#[test]
fn apop_with_wrong_digest_fails() {
    let mut fx = fixture();
    greet(&mut fx.session);

    let reply = send(&mut fx.session, &format!("APOP bob {}", "0".repeat(32)));
    assert!(reply.starts_with("-ERR"), "{reply}");

    let reply = send(&mut fx.session, "STAT");
    assert!(reply.starts_with("-ERR"), "{reply}");
}

#[test]
fn stat_and_list_report_sizes() {
    let mut fx = fixture();
    login(&mut fx.session);

    let total: u64 = [
        b"Subject: a\r\n\r\nfirst\r\n".len(),
        b"Subject: b\r\n\r\nsecond\r\n".len(),
        b"Subject: dots\r\n\r\n.single dot line\r\nplain line\r\n".len(),
    ]
    .iter()
    .map(|n| *n as u64)
    .sum();

    let reply = send(&mut fx.session, "STAT");
    assert_eq!(reply, format!("+OK 3 {total}\r\n"));

    let reply = send(&mut fx.session, "LIST");
    assert!(reply.starts_with("+OK 3 messages\r\n"), "{reply}");
    assert!(reply.contains("\r\n1 "), "{reply}");
    assert!(reply.ends_with(".\r\n"), "{reply}");

    let reply = send(&mut fx.session, "LIST 2");
    assert_eq!(
        reply,
        format!("+OK 2 {}\r\n", b"Subject: b\r\n\r\nsecond\r\n".len())
    );

    let reply = send(&mut fx.session, "LIST 9");
    assert!(reply.starts_with("-ERR"), "{reply}");
}

#[test]
fn retr_applies_dot_stuffing_and_terminator() {
    let mut fx = fixture();
    login(&mut fx.session);

    let reply = send(&mut fx.session, "RETR 3");
    assert!(reply.starts_with("+OK"), "{reply}");
    // The line starting with a period is stuffed on the wire.
    assert!(reply.contains("\r\n..single dot line\r\n"), "{reply}");
    assert!(reply.contains("\r\nplain line\r\n"), "{reply}");
    assert!(reply.ends_with("\r\n.\r\n"), "{reply}");
}

#[test]
fn top_returns_headers_and_limited_body() {
    let mut fx = fixture();
    login(&mut fx.session);

    let reply = send(&mut fx.session, "TOP 3 1");
    assert!(reply.contains("Subject: dots"), "{reply}");
    assert!(reply.contains("..single dot line"), "{reply}");
    assert!(!reply.contains("plain line"), "{reply}");
    assert!(reply.ends_with(".\r\n"), "{reply}");
}

#[test]
fn dele_without_quit_is_non_destructive() {
    let fx = fixture();
    let store = fx.store.clone();
    let mut session = reconnect(&fx);
    login(&mut session);

    let reply = send(&mut session, "DELE 2");
    assert!(reply.starts_with("+OK"), "{reply}");

    // The marked message vanishes from this session's view.
    let reply = send(&mut session, "STAT");
    assert!(reply.starts_with("+OK 2 "), "{reply}");
    let reply = send(&mut session, "RETR 2");
    assert!(reply.starts_with("-ERR"), "{reply}");

    // Drop the connection without QUIT; marks must be discarded.
    drop(session);
    assert_eq!(store.message_count("bob", "INBOX"), 3);

    let mut session = reconnect(&fx);
    login(&mut session);
    let reply = send(&mut session, "STAT");
    assert!(reply.starts_with("+OK 3 "), "{reply}");
}

#[test]
fn quit_in_transaction_commits_deletions() {
    let mut fx = fixture();
    login(&mut fx.session);

    send(&mut fx.session, "DELE 2");
    let reply = send(&mut fx.session, "QUIT");
    assert!(reply.starts_with("+OK"), "{reply}");
    assert!(fx.session.endpoint_mut().close_requested());

    assert_eq!(fx.store.message_count("bob", "INBOX"), 2);

    // Nothing is served after UPDATE.
    let reply = send(&mut fx.session, "STAT");
    assert!(reply.starts_with("-ERR"), "{reply}");
}

#[test]
fn rset_clears_marks() {
    let mut fx = fixture();
    login(&mut fx.session);

    send(&mut fx.session, "DELE 1");
    send(&mut fx.session, "DELE 3");
    let reply = send(&mut fx.session, "RSET");
    assert!(reply.starts_with("+OK"), "{reply}");

    let reply = send(&mut fx.session, "STAT");
    assert!(reply.starts_with("+OK 3 "), "{reply}");
}

#[test]
fn dele_twice_is_an_error() {
    let mut fx = fixture();
    login(&mut fx.session);

    assert!(send(&mut fx.session, "DELE 1").starts_with("+OK"));
    assert!(send(&mut fx.session, "DELE 1").starts_with("-ERR"));
    assert!(send(&mut fx.session, "DELE 99").starts_with("-ERR"));
}

#[test]
fn uidl_is_stable_across_sessions() {
    let mut fx = fixture();
    login(&mut fx.session);

    let first = send(&mut fx.session, "UIDL 1");
    assert!(first.starts_with("+OK 1 "), "{first}");
    send(&mut fx.session, "QUIT");

    let mut session = reconnect(&fx);
    login(&mut session);
    let second = send(&mut session, "UIDL 1");
    assert_eq!(first, second);
}

#[test]
fn state_matrix_is_enforced() {
    let mut fx = fixture();
    greet(&mut fx.session);

    // TRANSACTION commands in AUTHORIZATION.
    for line in ["STAT", "LIST", "RETR 1", "DELE 1", "RSET", "TOP 1 0", "UIDL"] {
        let reply = send(&mut fx.session, line);
        assert!(reply.starts_with("-ERR"), "{line} -> {reply}");
    }

    send(&mut fx.session, "USER bob");
    send(&mut fx.session, "PASS hunter2");

    // AUTHORIZATION commands in TRANSACTION.
    for line in ["USER bob", "PASS hunter2", "STLS", "UTF8"] {
        let reply = send(&mut fx.session, line);
        assert!(reply.starts_with("-ERR"), "{line} -> {reply}");
    }
}

#[test]
fn user_pass_refused_on_insecure_channel_by_default() {
    let mut fx = fixture_with(|config| config.allow_plaintext = false);
    greet(&mut fx.session);

    let reply = send(&mut fx.session, "USER bob");
    assert!(reply.starts_with("-ERR"), "{reply}");

    // Once the channel is secure, USER/PASS works.
    fx.session.endpoint_mut().set_secure(SecurityInfo::default());
    let reply = send(&mut fx.session, "USER bob");
    assert!(reply.starts_with("+OK"), "{reply}");
    let reply = send(&mut fx.session, "PASS hunter2");
    assert!(reply.starts_with("+OK"), "{reply}");
}

#[test]
fn capa_reflects_channel_and_configuration() {
    let mut fx = fixture();
    greet(&mut fx.session);

    let reply = send(&mut fx.session, "CAPA");
    assert!(reply.starts_with("+OK"), "{reply}");
    assert!(reply.contains("\r\nTOP\r\n"), "{reply}");
    assert!(reply.contains("\r\nUIDL\r\n"), "{reply}");
    assert!(reply.contains("\r\nSTLS\r\n"), "{reply}");
    assert!(reply.contains("\r\nPIPELINING\r\n"), "{reply}");
    assert!(reply.contains("SASL"), "{reply}");
    assert!(reply.ends_with(".\r\n"), "{reply}");

    // STLS is no longer advertised once the channel is secure.
    fx.session.endpoint_mut().set_secure(SecurityInfo::default());
    let reply = send(&mut fx.session, "CAPA");
    assert!(!reply.contains("\r\nSTLS\r\n"), "{reply}");
}

#[test]
fn stls_triggers_upgrade_and_rejects_when_secure() {
    let mut fx = fixture();
    greet(&mut fx.session);

    let reply = send(&mut fx.session, "STLS");
    assert!(reply.starts_with("+OK"), "{reply}");
    assert!(fx.session.endpoint_mut().take_tls_request());

    fx.session.endpoint_mut().set_secure(SecurityInfo::default());
    fx.session.security_established();
    let reply = send(&mut fx.session, "STLS");
    assert!(reply.starts_with("-ERR"), "{reply}");
}

#[test]
fn auth_plain_via_sasl() {
    let mut fx = fixture();
    greet(&mut fx.session);

    // base64("\0bob\0hunter2")
    let reply = send(&mut fx.session, "AUTH PLAIN AGJvYgBodW50ZXIy");
    assert!(reply.starts_with("+OK"), "{reply}");

    let reply = send(&mut fx.session, "STAT");
    assert!(reply.starts_with("+OK 3 "), "{reply}");
}

#[test]
fn auth_continuation_abort_with_star() {
    let mut fx = fixture();
    greet(&mut fx.session);

    let reply = send(&mut fx.session, "AUTH PLAIN");
    assert!(reply.starts_with("+ "), "{reply}");

    let reply = send(&mut fx.session, "*");
    assert!(reply.starts_with("-ERR"), "{reply}");

    // The sub-state is reset: the next line is a command again.
    let reply = send(&mut fx.session, "CAPA");
    assert!(reply.starts_with("+OK"), "{reply}");
}

#[test]
fn auth_without_mechanism_lists_mechanisms() {
    let mut fx = fixture();
    greet(&mut fx.session);

    let reply = send(&mut fx.session, "AUTH");
    assert!(reply.starts_with("+OK"), "{reply}");
    assert!(reply.contains("\r\nPLAIN\r\n"), "{reply}");
    assert!(reply.contains("\r\nCRAM-MD5\r\n"), "{reply}");
    assert!(reply.ends_with(".\r\n"), "{reply}");
}

#[test]
fn auth_cram_md5_round_trip() {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    let mut fx = fixture();
    greet(&mut fx.session);

    let reply = send(&mut fx.session, "AUTH CRAM-MD5");
    assert!(reply.starts_with("+ "), "{reply}");
    let challenge =
        String::from_utf8(BASE64.decode(reply.trim_start_matches("+ ").trim()).unwrap()).unwrap();

    let digest = MemoryRealm::hmac_md5_hex("hunter2", &challenge);
    let reply = send(&mut fx.session, &BASE64.encode(format!("bob {digest}")));
    assert!(reply.starts_with("+OK"), "{reply}");
}

#[test]
fn login_delay_applies_after_repeated_failures() {
    let mut fx = fixture_with(|config| config.max_auth_failures = 2);
    greet(&mut fx.session);

    send(&mut fx.session, "USER bob");
    send(&mut fx.session, "PASS wrong");
    assert!(fx.session.take_delay().is_none());

    send(&mut fx.session, "USER bob");
    send(&mut fx.session, "PASS stillwrong");
    assert_eq!(fx.session.take_delay(), Some(fx.ctx.config.login_delay));

    // The delay is handed out once per infraction.
    assert!(fx.session.take_delay().is_none());
}

#[test]
fn utf8_command_respects_configuration() {
    let mut fx = fixture_with(|config| config.enable_utf8 = true);
    greet(&mut fx.session);
    let reply = send(&mut fx.session, "UTF8");
    assert!(reply.starts_with("+OK"), "{reply}");

    let mut fx = fixture();
    greet(&mut fx.session);
    let reply = send(&mut fx.session, "UTF8");
    assert!(reply.starts_with("-ERR"), "{reply}");
}

#[test]
fn non_ascii_input_is_rejected() {
    let mut fx = fixture();
    greet(&mut fx.session);

    fx.session.receive(b"USER b\xc3\xb6b\r\n").unwrap();
    let reply = output(&mut fx.session);
    assert!(reply.starts_with("-ERR Non-ASCII"), "{reply}");

    // The connection survives.
    let reply = send(&mut fx.session, "CAPA");
    assert!(reply.starts_with("+OK"), "{reply}");
}

#[test]
fn oversized_line_is_fatal() {
    let mut fx = fixture();
    greet(&mut fx.session);

    let long_line = format!("USER {}\r\n", "x".repeat(600));
    assert!(fx.session.receive(long_line.as_bytes()).is_err());
    let reply = output(&mut fx.session);
    assert!(reply.starts_with("-ERR"), "{reply}");
    assert!(fx.session.endpoint_mut().close_requested());
}

#[test]
fn quit_in_authorization_just_closes() {
    let mut fx = fixture();
    greet(&mut fx.session);

    let reply = send(&mut fx.session, "QUIT");
    assert!(reply.starts_with("+OK"), "{reply}");
    assert!(fx.session.endpoint_mut().close_requested());
    assert_eq!(fx.store.message_count("bob", "INBOX"), 3);
}
