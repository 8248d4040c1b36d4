//! Authentication mechanism names.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use thiserror::Error;

/// A SASL mechanism supported by the server.
///
/// ```text
/// AUTH=PLAIN AUTH=LOGIN AUTH=CRAM-MD5 ...
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// One response: `base64(authzid NUL authcid NUL password)`.
    ///
    /// # Reference(s):
    ///
    /// * RFC 4616: The PLAIN Simple Authentication and Security Layer (SASL) Mechanism
    Plain,

    /// Two responses: base64 username, then base64 password.
    ///
    /// # Reference(s):
    ///
    /// * draft-murchison-sasl-login-00: The LOGIN SASL Mechanism
    Login,

    /// Server challenge, then `user SP hex-hmac-md5(password, challenge)`.
    ///
    /// # Reference(s):
    ///
    /// * RFC 2195: IMAP/POP AUTHorize Extension for Simple Challenge/Response
    CramMd5,

    /// HTTP-Digest-style challenge/response.
    ///
    /// # Reference(s):
    ///
    /// * RFC 2831: Using Digest Authentication as a SASL Mechanism
    DigestMd5,

    /// Salted challenge/response with mutual authentication.
    ///
    /// # Reference(s):
    ///
    /// * RFC 7677: SCRAM-SHA-256 and SCRAM-SHA-256-PLUS
    ScramSha256,

    /// OAuth 2.0 bearer token.
    ///
    /// # Reference(s):
    ///
    /// * RFC 7628: A Set of SASL Mechanisms for OAuth
    OAuthBearer,

    /// Trust derived from the TLS peer certificate.
    ///
    /// # Reference(s):
    ///
    /// * RFC 4422, Appendix A: The SASL EXTERNAL Mechanism
    External,

    /// NT LAN Manager challenge/response.
    Ntlm,
}

/// All mechanisms the engine knows how to drive.
pub const ALL_MECHANISMS: &[Mechanism] = &[
    Mechanism::Plain,
    Mechanism::Login,
    Mechanism::CramMd5,
    Mechanism::DigestMd5,
    Mechanism::ScramSha256,
    Mechanism::OAuthBearer,
    Mechanism::External,
    Mechanism::Ntlm,
];

impl Mechanism {
    /// Whether this mechanism must be refused on an insecure channel.
    ///
    /// Mechanisms that transmit reusable credentials in the clear require
    /// TLS unless the listener explicitly allows plaintext. EXTERNAL is
    /// meaningless without a peer certificate and therefore always
    /// requires a secured channel.
    pub fn requires_tls(&self, allow_plaintext: bool) -> bool {
        match self {
            Mechanism::Plain | Mechanism::Login | Mechanism::OAuthBearer => !allow_plaintext,
            Mechanism::External => true,
            Mechanism::CramMd5
            | Mechanism::DigestMd5
            | Mechanism::ScramSha256
            | Mechanism::Ntlm => false,
        }
    }
}

impl AsRef<str> for Mechanism {
    fn as_ref(&self) -> &str {
        match self {
            Mechanism::Plain => "PLAIN",
            Mechanism::Login => "LOGIN",
            Mechanism::CramMd5 => "CRAM-MD5",
            Mechanism::DigestMd5 => "DIGEST-MD5",
            Mechanism::ScramSha256 => "SCRAM-SHA-256",
            Mechanism::OAuthBearer => "OAUTHBEARER",
            Mechanism::External => "EXTERNAL",
            Mechanism::Ntlm => "NTLM",
        }
    }
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown SASL mechanism: {0}")]
pub struct UnknownMechanism(pub String);

impl FromStr for Mechanism {
    type Err = UnknownMechanism;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(Mechanism::Plain),
            "LOGIN" => Ok(Mechanism::Login),
            "CRAM-MD5" => Ok(Mechanism::CramMd5),
            "DIGEST-MD5" => Ok(Mechanism::DigestMd5),
            "SCRAM-SHA-256" => Ok(Mechanism::ScramSha256),
            "OAUTHBEARER" => Ok(Mechanism::OAuthBearer),
            "EXTERNAL" => Ok(Mechanism::External),
            "NTLM" => Ok(Mechanism::Ntlm),
            other => Err(UnknownMechanism(other.to_owned())),
        }
    }
}
