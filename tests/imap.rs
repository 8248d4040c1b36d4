//! IMAP session scenarios driven through the in-memory endpoint.

use std::sync::Arc;

use mailgate::{
    endpoint::{BufferedEndpoint, SecurityInfo},
    imap::{ImapContext, ImapSession},
    quota::QuotaManager,
    testing::{MemoryQuota, MemoryRealm, MemoryStore},
    ImapConfig,
};

struct Fixture {
    session: ImapSession<BufferedEndpoint>,
    store: MemoryStore,
    quota: Arc<MemoryQuota>,
}

fn fixture_with(configure: impl FnOnce(&mut ImapConfig)) -> Fixture {
    let mut realm = MemoryRealm::new();
    realm.add_user("alice", "s3cret");
    realm.add_user("root", "hunter2");
    realm.add_role("root", "admin");

    let store = MemoryStore::new();
    store.add_user("alice");
    store.add_user("root");
    store.add_message("alice", "INBOX", b"Subject: one\r\nFrom: carol\r\n\r\nfirst body\r\n");
    store.add_message("alice", "INBOX", b"Subject: two\r\n\r\nsecond body\r\n");

    let quota = Arc::new(MemoryQuota::new());

    let mut config = ImapConfig {
        host_name: "mail.example.org".into(),
        ..ImapConfig::default()
    };
    configure(&mut config);

    let ctx = Arc::new(ImapContext {
        config,
        realm: Arc::new(realm),
        store: Arc::new(store.clone()),
        quota: Arc::clone(&quota) as Arc<dyn QuotaManager>,
        tls_available: true,
    });

    Fixture {
        session: ImapSession::new(ctx, BufferedEndpoint::detached()),
        store,
        quota,
    }
}

fn fixture() -> Fixture {
    fixture_with(|_| {})
}

fn send(session: &mut ImapSession<BufferedEndpoint>, line: &str) -> String {
    session
        .receive(format!("{line}\r\n").as_bytes())
        .expect("connection stays alive");
    output(session)
}

fn output(session: &mut ImapSession<BufferedEndpoint>) -> String {
    String::from_utf8(session.endpoint_mut().take_output()).expect("responses are UTF-8")
}

fn secure(session: &mut ImapSession<BufferedEndpoint>) {
    session.endpoint_mut().set_secure(SecurityInfo::default());
}

fn login(fixture: &mut Fixture) {
    secure(&mut fixture.session);
    fixture.session.greet();
    output(&mut fixture.session);
    let reply = send(&mut fixture.session, "a0 LOGIN alice s3cret");
    assert!(reply.starts_with("a0 OK"), "{reply}");
}

#[test]
fn greeting_advertises_capabilities() {
    let mut fx = fixture();
    fx.session.greet();
    let greeting = output(&mut fx.session);

    assert!(greeting.starts_with("* OK [CAPABILITY IMAP4rev2"), "{greeting}");
    assert!(greeting.contains("STARTTLS"), "{greeting}");
    assert!(greeting.contains("LOGINDISABLED"), "{greeting}");
    assert!(greeting.contains("mail.example.org"), "{greeting}");
}

#[test]
fn starttls_not_advertised_once_secure() {
    let mut fx = fixture();
    secure(&mut fx.session);
    fx.session.greet();
    let greeting = output(&mut fx.session);

    assert!(!greeting.contains("STARTTLS"), "{greeting}");
    assert!(!greeting.contains("LOGINDISABLED"), "{greeting}");
    assert!(greeting.contains("AUTH=PLAIN"), "{greeting}");
}

#[test]
fn login_then_select_happy_path() {
    let mut fx = fixture();
    secure(&mut fx.session);
    fx.session.greet();
    output(&mut fx.session);

    let reply = send(&mut fx.session, "a1 LOGIN alice \"s3cret\"");
    assert!(reply.starts_with("a1 OK [CAPABILITY"), "{reply}");

    let reply = send(&mut fx.session, "a2 SELECT INBOX");
    let lines: Vec<&str> = reply.lines().collect();
    assert_eq!(lines[0], "* 2 EXISTS");
    assert_eq!(lines[1], "* 2 RECENT");
    assert!(lines[2].starts_with("* FLAGS ("), "{reply}");
    assert!(lines[3].starts_with("* OK [PERMANENTFLAGS ("), "{reply}");
    assert!(lines[3].contains("\\*"), "{reply}");
    assert!(lines[4].starts_with("* OK [UIDVALIDITY "), "{reply}");
    assert!(lines[5].starts_with("* OK [UIDNEXT "), "{reply}");
    assert!(lines[6].starts_with("a2 OK [READ-WRITE] Select completed"), "{reply}");
}

#[test]
fn plaintext_login_refused_on_insecure_channel() {
    let mut fx = fixture();
    fx.session.greet();
    output(&mut fx.session);

    let reply = send(&mut fx.session, "a1 LOGIN alice s3cret");
    assert!(reply.starts_with("a1 NO [PRIVACYREQUIRED]"), "{reply}");
}

#[test]
fn state_matrix_is_enforced() {
    let mut fx = fixture();
    secure(&mut fx.session);
    fx.session.greet();
    output(&mut fx.session);

    // Selected-state commands before authentication.
    for line in ["b1 SELECT INBOX", "b2 FETCH 1 FLAGS", "b3 CLOSE"] {
        let reply = send(&mut fx.session, line);
        assert!(reply.contains("BAD"), "{line} -> {reply}");
    }

    let reply = send(&mut fx.session, "b4 LOGIN alice s3cret");
    assert!(reply.starts_with("b4 OK"), "{reply}");

    // Non-authenticated commands after authentication.
    for line in ["b5 LOGIN alice s3cret", "b6 AUTHENTICATE PLAIN", "b7 STARTTLS"] {
        let reply = send(&mut fx.session, line);
        assert!(reply.contains("BAD"), "{line} -> {reply}");
    }

    // Selected-only commands while merely authenticated.
    for line in ["b8 EXPUNGE", "b9 STORE 1 +FLAGS \\Seen"] {
        let reply = send(&mut fx.session, line);
        assert!(reply.contains("BAD"), "{line} -> {reply}");
    }
}

#[test]
fn invalid_tags_get_untagged_bad() {
    let mut fx = fixture();
    fx.session.greet();
    output(&mut fx.session);

    for line in ["* NOOP", "+ NOOP", "ta(g NOOP", "bad{ NOOP", ""] {
        let reply = send(&mut fx.session, line);
        assert!(reply.starts_with("* BAD"), "{line:?} -> {reply}");
    }

    // The session survives and still serves valid commands.
    let reply = send(&mut fx.session, "a1 NOOP");
    assert!(reply.starts_with("a1 OK"), "{reply}");
}

#[test]
fn append_with_sync_literal() {
    let mut fx = fixture();
    login(&mut fx);

    let reply = send(&mut fx.session, "a1 APPEND INBOX (\\Seen) {15}");
    assert!(reply.starts_with("+ Ready"), "{reply}");

    // Deliver the literal in two chunks: no tagged reply until all
    // fifteen octets arrived.
    fx.session.receive(b"Subject:").unwrap();
    assert_eq!(output(&mut fx.session), "");

    fx.session.receive(b" hi\r\n\r\n").unwrap();
    let reply = output(&mut fx.session);
    assert!(reply.starts_with("a1 OK [APPENDUID 1 3]"), "{reply}");

    assert_eq!(fx.store.message_count("alice", "INBOX"), 3);
}

#[test]
fn append_with_non_sync_literal_sends_no_continuation() {
    let mut fx = fixture();
    login(&mut fx);

    // Command line and literal arrive in one write; the server must not
    // emit a continuation request.
    fx.session
        .receive(b"a1 APPEND INBOX {12+}\r\nHello world!\r\n")
        .unwrap();
    let reply = output(&mut fx.session);
    assert!(!reply.contains('+'), "{reply}");
    assert!(reply.starts_with("a1 OK [APPENDUID 1 3]"), "{reply}");

    // The connection keeps working after the swallowed literal CRLF.
    let reply = send(&mut fx.session, "a2 NOOP");
    assert!(reply.starts_with("a2 OK"), "{reply}");
}

#[test]
fn append_over_quota_is_rejected_before_continuation() {
    let mut fx = fixture();
    login(&mut fx);
    fx.quota.set_limits("alice", Some(10), None);

    let reply = send(&mut fx.session, "a1 APPEND INBOX {100}");
    assert!(reply.starts_with("a1 NO [OVERQUOTA]"), "{reply}");
    assert!(!reply.contains("+ "), "{reply}");
    assert_eq!(fx.store.message_count("alice", "INBOX"), 2);
}

#[test]
fn sasl_abort_resets_the_exchange() {
    let mut fx = fixture();
    secure(&mut fx.session);
    fx.session.greet();
    output(&mut fx.session);

    let reply = send(&mut fx.session, "a4 AUTHENTICATE PLAIN");
    assert!(reply.starts_with("+ "), "{reply}");

    let reply = send(&mut fx.session, "*");
    assert!(reply.starts_with("a4 BAD"), "{reply}");

    // The next line is a command again, not a continuation.
    let reply = send(&mut fx.session, "a5 NOOP");
    assert!(reply.starts_with("a5 OK"), "{reply}");
}

#[test]
fn authenticate_plain_with_initial_response() {
    let mut fx = fixture();
    secure(&mut fx.session);
    fx.session.greet();
    output(&mut fx.session);

    // base64("\0alice\0s3cret")
    let reply = send(&mut fx.session, "a1 AUTHENTICATE PLAIN AGFsaWNlAHMzY3JldA==");
    assert!(reply.starts_with("a1 OK"), "{reply}");

    let reply = send(&mut fx.session, "a2 SELECT INBOX");
    assert!(reply.contains("a2 OK [READ-WRITE]"), "{reply}");
}

#[test]
fn authenticate_scram_full_exchange() {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    let mut fx = fixture();
    fx.session.greet();
    output(&mut fx.session);

    let client_first_bare = "n=alice,r=clientnonce";
    let initial = BASE64.encode(format!("n,,{client_first_bare}"));
    let reply = send(
        &mut fx.session,
        &format!("a1 AUTHENTICATE SCRAM-SHA-256 {initial}"),
    );
    assert!(reply.starts_with("+ "), "{reply}");
    let server_first =
        String::from_utf8(BASE64.decode(reply.trim_start_matches("+ ").trim()).unwrap()).unwrap();

    let client_final =
        MemoryRealm::scram_client_final("s3cret", client_first_bare, &server_first);
    let reply = send(&mut fx.session, &BASE64.encode(client_final));
    assert!(reply.starts_with("+ "), "{reply}");
    let server_final =
        String::from_utf8(BASE64.decode(reply.trim_start_matches("+ ").trim()).unwrap()).unwrap();
    assert!(server_final.starts_with("v="), "{server_final}");

    // Empty acknowledgement completes the exchange.
    let reply = send(&mut fx.session, "");
    assert!(reply.starts_with("a1 OK"), "{reply}");
}

#[test]
fn idle_only_accepts_done() {
    let mut fx = fixture();
    login(&mut fx);
    send(&mut fx.session, "a1 SELECT INBOX");

    let reply = send(&mut fx.session, "a2 IDLE");
    assert!(reply.starts_with("+ idling"), "{reply}");

    // Anything but DONE is rejected without leaving IDLE.
    let reply = send(&mut fx.session, "a3 NOOP");
    assert!(reply.starts_with("* BAD Expected DONE"), "{reply}");
    let reply = send(&mut fx.session, "still not done");
    assert!(reply.starts_with("* BAD Expected DONE"), "{reply}");

    let reply = send(&mut fx.session, "done");
    assert!(reply.starts_with("a2 OK"), "{reply}");

    // Back to normal dispatch.
    let reply = send(&mut fx.session, "a4 NOOP");
    assert!(reply.starts_with("a4 OK"), "{reply}");
}

#[test]
fn idle_reports_new_messages_on_done() {
    let mut fx = fixture();
    login(&mut fx);
    send(&mut fx.session, "a1 SELECT INBOX");

    send(&mut fx.session, "a2 IDLE");
    fx.store.add_message("alice", "INBOX", b"Subject: three\r\n\r\nnew\r\n");

    let reply = send(&mut fx.session, "DONE");
    assert!(reply.contains("* 3 EXISTS"), "{reply}");
    assert!(reply.contains("a2 OK"), "{reply}");
}

#[test]
fn select_close_status_round_trip() {
    let mut fx = fixture();
    login(&mut fx);

    let select_reply = send(&mut fx.session, "a1 SELECT INBOX");
    let reply = send(&mut fx.session, "a2 CLOSE");
    assert!(reply.starts_with("a2 OK"), "{reply}");

    let status_reply = send(&mut fx.session, "a3 STATUS INBOX (MESSAGES UIDVALIDITY UIDNEXT)");
    assert!(
        status_reply.contains("* STATUS INBOX (MESSAGES 2 UIDVALIDITY 1 UIDNEXT 3)"),
        "{status_reply}"
    );
    assert!(select_reply.contains("* 2 EXISTS"), "{select_reply}");
    assert!(select_reply.contains("[UIDVALIDITY 1]"), "{select_reply}");
    assert!(select_reply.contains("[UIDNEXT 3]"), "{select_reply}");
}

#[test]
fn search_returns_sequence_numbers_or_uids() {
    let mut fx = fixture();
    login(&mut fx);
    send(&mut fx.session, "a1 SELECT INBOX");
    send(&mut fx.session, "a2 STORE 1 +FLAGS.SILENT (\\Seen)");

    let reply = send(&mut fx.session, "a3 SEARCH UNSEEN");
    assert!(reply.contains("* SEARCH 2\r\n"), "{reply}");

    let reply = send(&mut fx.session, "a4 SEARCH FROM carol");
    assert!(reply.contains("* SEARCH 1\r\n"), "{reply}");

    let reply = send(&mut fx.session, "a5 UID SEARCH ALL");
    assert!(reply.contains("* SEARCH 1 2\r\n"), "{reply}");
}

#[test]
fn fetch_serves_flags_size_and_body() {
    let mut fx = fixture();
    login(&mut fx);
    send(&mut fx.session, "a1 SELECT INBOX");

    let reply = send(&mut fx.session, "a2 FETCH 2 (UID RFC822.SIZE)");
    assert!(reply.contains("* 2 FETCH (UID 2 RFC822.SIZE 29)"), "{reply}");

    let reply = send(&mut fx.session, "a3 FETCH 2 BODY[]");
    assert!(reply.contains("BODY[] {29}\r\nSubject: two\r\n\r\nsecond body\r\n"), "{reply}");

    // BODY[] set \Seen; BODY.PEEK[] must not have.
    let reply = send(&mut fx.session, "a4 FETCH 2 FLAGS");
    assert!(reply.contains("\\Seen"), "{reply}");
}

#[test]
fn store_reports_new_flags_unless_silent() {
    let mut fx = fixture();
    login(&mut fx);
    send(&mut fx.session, "a1 SELECT INBOX");

    let reply = send(&mut fx.session, "a2 STORE 1 +FLAGS (\\Flagged)");
    assert!(reply.contains("* 1 FETCH (FLAGS ("), "{reply}");
    assert!(reply.contains("\\Flagged"), "{reply}");

    let reply = send(&mut fx.session, "a3 STORE 1 -FLAGS.SILENT (\\Flagged)");
    assert!(!reply.contains("FETCH"), "{reply}");
    assert!(reply.starts_with("a3 OK"), "{reply}");
}

#[test]
fn copy_and_expunge() {
    let mut fx = fixture();
    login(&mut fx);
    send(&mut fx.session, "a1 CREATE Archive");
    send(&mut fx.session, "a2 SELECT INBOX");

    let reply = send(&mut fx.session, "a3 COPY 1:2 Archive");
    assert!(reply.starts_with("a3 OK"), "{reply}");
    assert_eq!(fx.store.message_count("alice", "Archive"), 2);

    let reply = send(&mut fx.session, "a4 COPY 1 NoSuchBox");
    assert!(reply.starts_with("a4 NO [TRYCREATE]"), "{reply}");

    send(&mut fx.session, "a5 STORE 1 +FLAGS.SILENT (\\Deleted)");
    let reply = send(&mut fx.session, "a6 EXPUNGE");
    assert!(reply.contains("* 1 EXPUNGE"), "{reply}");
    assert!(reply.contains("a6 OK"), "{reply}");
    assert_eq!(fx.store.message_count("alice", "INBOX"), 1);
}

#[test]
fn move_copies_then_expunges() {
    let mut fx = fixture();
    login(&mut fx);
    send(&mut fx.session, "a1 CREATE Trash");
    send(&mut fx.session, "a2 SELECT INBOX");

    let reply = send(&mut fx.session, "a3 MOVE 1 Trash");
    assert!(reply.contains("* 1 EXPUNGE"), "{reply}");
    assert!(reply.contains("a3 OK"), "{reply}");
    assert_eq!(fx.store.message_count("alice", "Trash"), 1);
    assert_eq!(fx.store.message_count("alice", "INBOX"), 1);
}

#[test]
fn list_and_namespace() {
    let mut fx = fixture();
    login(&mut fx);
    send(&mut fx.session, "a1 CREATE Work");

    let reply = send(&mut fx.session, "a2 LIST \"\" *");
    assert!(reply.contains("* LIST () \"/\" INBOX"), "{reply}");
    assert!(reply.contains("* LIST () \"/\" Work"), "{reply}");

    let reply = send(&mut fx.session, "a3 LIST \"\" \"\"");
    assert!(reply.contains("* LIST (\\Noselect) \"/\" \"\""), "{reply}");

    let reply = send(&mut fx.session, "a4 NAMESPACE");
    assert!(reply.contains("* NAMESPACE ((\"\" \"/\")) NIL NIL"), "{reply}");
}

#[test]
fn quota_reporting_and_admin_setquota() {
    let mut fx = fixture();
    login(&mut fx);
    fx.quota.set_limits("alice", Some(1024 * 1024), None);

    let reply = send(&mut fx.session, "a1 GETQUOTAROOT INBOX");
    assert!(reply.contains("* QUOTAROOT INBOX \"\""), "{reply}");
    assert!(reply.contains("* QUOTA \"\" (STORAGE 0 1024)"), "{reply}");

    // Plain users cannot set quotas.
    let reply = send(&mut fx.session, "a2 SETQUOTA \"\" (STORAGE 2048)");
    assert!(reply.starts_with("a2 NO"), "{reply}");

    // An admin can.
    let mut admin = fixture();
    secure(&mut admin.session);
    admin.session.greet();
    output(&mut admin.session);
    send(&mut admin.session, "r1 LOGIN root hunter2");
    let reply = send(&mut admin.session, "r2 SETQUOTA alice (STORAGE 512 MESSAGE 100)");
    assert!(reply.contains("* QUOTA alice (STORAGE 0 512 MESSAGE 0 100)"), "{reply}");
    assert!(reply.contains("r2 OK"), "{reply}");
}

#[test]
fn logout_says_bye_and_closes() {
    let mut fx = fixture();
    login(&mut fx);

    let reply = send(&mut fx.session, "a1 LOGOUT");
    assert!(reply.starts_with("* BYE"), "{reply}");
    assert!(reply.contains("a1 OK"), "{reply}");
    assert!(fx.session.endpoint_mut().close_requested());

    // No transition out of logout.
    let reply = send(&mut fx.session, "a2 NOOP");
    assert!(reply.contains("BAD"), "{reply}");
}

#[test]
fn starttls_triggers_upgrade_request() {
    let mut fx = fixture();
    fx.session.greet();
    output(&mut fx.session);

    let reply = send(&mut fx.session, "a1 STARTTLS");
    assert!(reply.starts_with("a1 OK"), "{reply}");
    assert!(fx.session.endpoint_mut().take_tls_request());

    // A second STARTTLS on a now-secure channel is refused.
    fx.session.endpoint_mut().set_secure(SecurityInfo::default());
    fx.session.security_established();
    let reply = send(&mut fx.session, "a2 STARTTLS");
    assert!(reply.starts_with("a2 BAD"), "{reply}");
}

#[test]
fn oversized_line_terminates_with_bye() {
    let mut fx = fixture_with(|config| config.max_line_length = 64);
    fx.session.greet();
    output(&mut fx.session);

    let long_line = format!("a1 LOGIN alice {}\r\n", "x".repeat(200));
    let result = fx.session.receive(long_line.as_bytes());
    assert!(result.is_err());

    let reply = output(&mut fx.session);
    assert!(reply.starts_with("* BYE"), "{reply}");
    assert!(fx.session.endpoint_mut().close_requested());
}

#[test]
fn examine_opens_read_only() {
    let mut fx = fixture();
    login(&mut fx);

    let reply = send(&mut fx.session, "a1 EXAMINE INBOX");
    assert!(reply.contains("a1 OK [READ-ONLY]"), "{reply}");

    let reply = send(&mut fx.session, "a2 STORE 1 +FLAGS (\\Seen)");
    assert!(reply.starts_with("a2 NO"), "{reply}");
}
