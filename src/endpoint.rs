//! Transport abstraction presented to the protocol engines.
//!
//! Engines interact with the peer only through [`Endpoint`]: they enqueue
//! outgoing bytes, request a close or a TLS upgrade, and observe the secure
//! state. The driver owning the socket decides how those requests are
//! realised, which keeps the engines free of transport concerns and lets
//! tests substitute an in-memory endpoint.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Details of a completed TLS handshake.
#[derive(Debug, Clone, Default)]
pub struct SecurityInfo {
    /// Negotiated protocol version, e.g. `TLSv1_3`.
    pub protocol: Option<String>,
    /// Negotiated cipher suite.
    pub cipher_suite: Option<String>,
    /// Peer certificate chain, DER-encoded, leaf first.
    pub peer_certificates: Vec<Vec<u8>>,
    /// Common name of the peer certificate's subject, when one was presented.
    pub peer_common_name: Option<String>,
}

/// The contract between a protocol engine and its transport.
pub trait Endpoint {
    /// Enqueue bytes for transmission. The driver flushes after the engine
    /// returns control.
    fn send(&mut self, bytes: &[u8]);

    /// Schedule a graceful close once pending sends have drained.
    fn close(&mut self);

    /// Request an in-band switch to TLS. The driver performs the handshake
    /// after flushing pending output and reports completion through the
    /// engine's `security_established`.
    fn start_tls(&mut self);

    /// Whether bytes on the wire are currently encrypted.
    fn is_secure(&self) -> bool;

    fn peer_addr(&self) -> SocketAddr;

    fn local_addr(&self) -> SocketAddr;

    /// Handshake details, once the channel is secure.
    fn security_info(&self) -> Option<&SecurityInfo>;
}

/// Buffering [`Endpoint`] implementation shared by the TCP driver and the
/// test suite. Writes accumulate in `output`; control requests are recorded
/// as flags for the owner to act upon.
#[derive(Debug)]
pub struct BufferedEndpoint {
    output: Vec<u8>,
    close_requested: bool,
    tls_requested: bool,
    secure: bool,
    security: Option<SecurityInfo>,
    peer: SocketAddr,
    local: SocketAddr,
}

impl BufferedEndpoint {
    pub fn new(peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            output: Vec::new(),
            close_requested: false,
            tls_requested: false,
            secure: false,
            security: None,
            peer,
            local,
        }
    }

    /// An endpoint with placeholder addresses, for tests.
    pub fn detached() -> Self {
        let nowhere = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        Self::new(nowhere, nowhere)
    }

    /// Drain everything the engine has enqueued since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Consume a pending TLS-upgrade request, if any.
    pub fn take_tls_request(&mut self) -> bool {
        std::mem::take(&mut self.tls_requested)
    }

    /// Record a completed handshake.
    pub fn set_secure(&mut self, info: SecurityInfo) {
        self.secure = true;
        self.security = Some(info);
    }
}

impl Endpoint for BufferedEndpoint {
    fn send(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    fn close(&mut self) {
        self.close_requested = true;
    }

    fn start_tls(&mut self) {
        self.tls_requested = true;
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn security_info(&self) -> Option<&SecurityInfo> {
        self.security.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_accumulates_until_taken() {
        let mut ep = BufferedEndpoint::detached();
        ep.send(b"+OK ");
        ep.send(b"ready\r\n");
        assert_eq!(ep.take_output(), b"+OK ready\r\n");
        assert!(ep.take_output().is_empty());
    }

    #[test]
    fn test_tls_request_is_consumed_once() {
        let mut ep = BufferedEndpoint::detached();
        assert!(!ep.take_tls_request());
        ep.start_tls();
        assert!(ep.take_tls_request());
        assert!(!ep.take_tls_request());
    }

    #[test]
    fn test_secure_after_handshake() {
        let mut ep = BufferedEndpoint::detached();
        assert!(!ep.is_secure());
        ep.set_secure(SecurityInfo::default());
        assert!(ep.is_secure());
        assert!(ep.security_info().is_some());
    }
}
