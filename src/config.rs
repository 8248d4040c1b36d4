//! Listener configuration records.
//!
//! Engines are configured through plain structures handed over at
//! listener-start time; nothing here is re-read after start-up.

use std::time::Duration;

/// Configuration of one IMAP listener.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub port: u16,
    /// Listener speaks TLS from the first byte (IMAPS).
    pub secure: bool,
    /// Host name used in greetings and authentication challenges.
    pub host_name: String,
    pub enable_idle: bool,
    pub enable_namespace: bool,
    pub enable_quota: bool,
    pub enable_move: bool,
    /// Maximum accepted command-line length, CRLF included.
    pub max_line_length: usize,
    /// Maximum accepted APPEND literal size in octets.
    pub max_literal_size: u64,
    /// Permit LOGIN and plaintext SASL mechanisms on an insecure channel.
    pub allow_plaintext_login: bool,
    /// Inactivity timeout before authentication.
    pub login_timeout: Duration,
    /// Inactivity timeout after authentication.
    pub command_timeout: Duration,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            port: 143,
            secure: false,
            host_name: "localhost".into(),
            enable_idle: true,
            enable_namespace: true,
            enable_quota: true,
            enable_move: true,
            max_line_length: 8192,
            max_literal_size: 32 * 1024 * 1024,
            allow_plaintext_login: false,
            login_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Configuration of one POP3 listener.
#[derive(Debug, Clone)]
pub struct Pop3Config {
    pub port: u16,
    /// Listener speaks TLS from the first byte (POP3S).
    pub secure: bool,
    /// Host name used in the APOP banner.
    pub host_name: String,
    pub enable_apop: bool,
    pub enable_utf8: bool,
    pub enable_pipelining: bool,
    /// Permit USER/PASS and plaintext SASL mechanisms on an insecure channel.
    pub allow_plaintext: bool,
    /// Authentication failures tolerated before the login delay applies.
    pub max_auth_failures: u32,
    /// Delay enforced after repeated authentication failures (RFC 2449).
    pub login_delay: Duration,
    /// Inactivity timeout; RFC 1939 demands at least 10 minutes.
    pub transaction_timeout: Duration,
}

impl Default for Pop3Config {
    fn default() -> Self {
        Self {
            port: 110,
            secure: false,
            host_name: "localhost".into(),
            enable_apop: true,
            enable_utf8: false,
            enable_pipelining: true,
            allow_plaintext: false,
            max_auth_failures: 3,
            login_delay: Duration::from_secs(2),
            transaction_timeout: Duration::from_secs(10 * 60),
        }
    }
}
