//! TCP listeners and the per-connection driver.
//!
//! Each accepted connection is served by one spawned task which owns the
//! socket and the protocol engine: bytes in, [`SessionEngine::receive`],
//! flush the endpoint buffer out. All engine callbacks for a connection
//! therefore run on that task, never concurrently. TLS is either implicit
//! (the listener's `secure` flag) or negotiated in-band when the engine
//! requests it after STARTTLS/STLS.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use rustls::ServerConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use crate::{
    endpoint::{BufferedEndpoint, SecurityInfo},
    error::FatalError,
    imap::{ImapContext, ImapSession},
    pop3::{Pop3Context, Pop3Session},
};

/// What the driver needs from a protocol engine; both engines provide it.
pub trait SessionEngine: Send {
    fn greet(&mut self);
    fn receive(&mut self, bytes: &[u8]) -> Result<(), FatalError>;
    fn security_established(&mut self);
    fn timed_out(&mut self);
    fn shutdown(&mut self);
    fn endpoint_mut(&mut self) -> &mut BufferedEndpoint;
    /// A delay to observe before flushing (POP3 login delay).
    fn take_delay(&mut self) -> Option<Duration>;
    fn applicable_timeout(&self) -> Duration;
}

impl SessionEngine for ImapSession<BufferedEndpoint> {
    fn greet(&mut self) {
        ImapSession::greet(self)
    }

    fn receive(&mut self, bytes: &[u8]) -> Result<(), FatalError> {
        ImapSession::receive(self, bytes)
    }

    fn security_established(&mut self) {
        ImapSession::security_established(self)
    }

    fn timed_out(&mut self) {
        ImapSession::timed_out(self)
    }

    fn shutdown(&mut self) {
        ImapSession::shutdown(self)
    }

    fn endpoint_mut(&mut self) -> &mut BufferedEndpoint {
        ImapSession::endpoint_mut(self)
    }

    fn take_delay(&mut self) -> Option<Duration> {
        None
    }

    fn applicable_timeout(&self) -> Duration {
        ImapSession::applicable_timeout(self)
    }
}

impl SessionEngine for Pop3Session<BufferedEndpoint> {
    fn greet(&mut self) {
        Pop3Session::greet(self)
    }

    fn receive(&mut self, bytes: &[u8]) -> Result<(), FatalError> {
        Pop3Session::receive(self, bytes)
    }

    fn security_established(&mut self) {
        Pop3Session::security_established(self)
    }

    fn timed_out(&mut self) {
        Pop3Session::timed_out(self)
    }

    fn shutdown(&mut self) {
        Pop3Session::shutdown(self)
    }

    fn endpoint_mut(&mut self) -> &mut BufferedEndpoint {
        Pop3Session::endpoint_mut(self)
    }

    fn take_delay(&mut self) -> Option<Duration> {
        Pop3Session::take_delay(self)
    }

    fn applicable_timeout(&self) -> Duration {
        Pop3Session::applicable_timeout(self)
    }
}

/// Serve IMAP connections until `shutdown` fires.
pub async fn serve_imap(
    ctx: Arc<ImapContext>,
    tls: Option<Arc<ServerConfig>>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let port = ctx.config.port;
    let implicit_tls = ctx.config.secure;
    serve(port, implicit_tls, tls, shutdown, move |endpoint| {
        ImapSession::new(Arc::clone(&ctx), endpoint)
    })
    .await
}

/// Serve POP3 connections until `shutdown` fires.
pub async fn serve_pop3(
    ctx: Arc<Pop3Context>,
    tls: Option<Arc<ServerConfig>>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let port = ctx.config.port;
    let implicit_tls = ctx.config.secure;
    serve(port, implicit_tls, tls, shutdown, move |endpoint| {
        Pop3Session::new(Arc::clone(&ctx), endpoint)
    })
    .await
}

async fn serve<S, F>(
    port: u16,
    implicit_tls: bool,
    tls: Option<Arc<ServerConfig>>,
    mut shutdown: watch::Receiver<bool>,
    make_session: F,
) -> std::io::Result<()>
where
    S: SessionEngine + 'static,
    F: Fn(BufferedEndpoint) -> S + Send + Sync + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("listening on port {port} (implicit TLS: {implicit_tls})");
    let acceptor = tls.map(TlsAcceptor::from);
    let make_session = Arc::new(make_session);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        error!("accept failed: {error}");
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let shutdown = shutdown.clone();
                let make_session = Arc::clone(&make_session);

                tokio::spawn(async move {
                    let local = stream
                        .local_addr()
                        .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
                    let session = make_session(BufferedEndpoint::new(peer, local));
                    if let Err(error) =
                        drive(session, stream, acceptor, implicit_tls, shutdown).await
                    {
                        debug!("connection from {peer} ended with error: {error}");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("listener on port {port} shutting down");
                return Ok(());
            }
        }
    }
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf).await,
            Transport::Tls(stream) => stream.read(buf).await,
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.write_all(bytes).await,
            Transport::Tls(stream) => stream.write_all(bytes).await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.shutdown().await,
            Transport::Tls(stream) => stream.shutdown().await,
        }
    }
}

fn security_info(tls: &TlsStream<TcpStream>) -> SecurityInfo {
    let (_, connection) = tls.get_ref();

    SecurityInfo {
        protocol: connection
            .protocol_version()
            .map(|version| format!("{version:?}")),
        cipher_suite: connection
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite())),
        peer_certificates: connection
            .peer_certificates()
            .map(|certs| certs.iter().map(|cert| cert.as_ref().to_vec()).collect())
            .unwrap_or_default(),
        peer_common_name: None,
    }
}

async fn drive<S: SessionEngine>(
    mut session: S,
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    implicit_tls: bool,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let mut transport = if implicit_tls {
        let Some(acceptor) = acceptor.clone() else {
            return Err(std::io::Error::other("implicit TLS requires a TLS context"));
        };
        let tls = acceptor.accept(stream).await?;
        session.endpoint_mut().set_secure(security_info(&tls));
        session.security_established();
        Transport::Tls(Box::new(tls))
    } else {
        Transport::Plain(stream)
    };

    // The greeting is deferred until the implicit handshake succeeded.
    session.greet();
    flush(&mut session, &mut transport).await?;

    let mut buf = vec![0u8; 8192];
    loop {
        if session.endpoint_mut().close_requested() {
            break;
        }

        let mut stop = false;
        let timeout = session.applicable_timeout();

        tokio::select! {
            result = tokio::time::timeout(timeout, transport.read(&mut buf)) => {
                match result {
                    Ok(Ok(0)) => {
                        debug!("connection closed by peer");
                        stop = true;
                    }
                    Ok(Ok(n)) => {
                        if session.receive(&buf[..n]).is_err() {
                            stop = true;
                        }
                    }
                    Ok(Err(error)) => {
                        debug!("read error: {error}");
                        stop = true;
                    }
                    Err(_) => {
                        session.timed_out();
                        stop = true;
                    }
                }
            }
            _ = shutdown.changed() => {
                session.shutdown();
                stop = true;
            }
        }

        // The POP3 login delay defers the failure reply, not just the
        // next read.
        if let Some(delay) = session.take_delay() {
            tokio::time::sleep(delay).await;
        }
        flush(&mut session, &mut transport).await?;

        if stop {
            break;
        }

        // In-band TLS upgrade requested by STARTTLS/STLS.
        if session.endpoint_mut().take_tls_request() {
            transport = match transport {
                Transport::Plain(plain) => {
                    let Some(acceptor) = acceptor.clone() else {
                        debug!("TLS upgrade requested without a TLS context");
                        return Ok(());
                    };
                    match acceptor.accept(plain).await {
                        Ok(tls) => {
                            session.endpoint_mut().set_secure(security_info(&tls));
                            session.security_established();
                            Transport::Tls(Box::new(tls))
                        }
                        Err(error) => {
                            // Failed upgrade closes the connection.
                            debug!("TLS handshake failed: {error}");
                            return Ok(());
                        }
                    }
                }
                already_tls => already_tls,
            };
        }

        if session.endpoint_mut().close_requested() {
            break;
        }
    }

    transport.shutdown().await.ok();
    Ok(())
}

async fn flush<S: SessionEngine>(
    session: &mut S,
    transport: &mut Transport,
) -> std::io::Result<()> {
    let output = session.endpoint_mut().take_output();
    if !output.is_empty() {
        transport.write_all(&output).await?;
    }
    Ok(())
}
