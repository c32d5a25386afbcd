//! Error types for the softphone core.
//!
//! Recoverable protocol conditions (401 challenges, 100 Trying, 500 backoff)
//! are handled inline by the client and never surface here.

use thiserror::Error;

/// Reasons an inbound SIP datagram failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The message advertised a SIP version other than SIP/2.0.
    /// The client answers these with 505 SIP Version Not Supported.
    #[error("SIP version {0} not compatible")]
    UnsupportedVersion(String),

    #[error("unable to decipher start line: {0}")]
    MalformedStartLine(String),

    /// One of the primary headers (Via, From, To, Call-ID, CSeq) is absent.
    #[error("missing required header {0}")]
    MissingHeader(&'static str),

    /// Content-Encoding is present; encoded bodies are not supported.
    #[error("unable to parse encoded content ({0})")]
    EncodedBodyUnsupported(String),

    #[error("malformed {context}: {detail}")]
    Malformed {
        context: &'static str,
        detail: String,
    },
}

impl ParseError {
    pub(crate) fn malformed(context: &'static str, detail: impl Into<String>) -> Self {
        ParseError::Malformed {
            context,
            detail: detail.into(),
        }
    }
}

/// Errors surfaced to callers of the SIP client and phone facade.
#[derive(Debug, Error)]
pub enum SipError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A second 401 after retrying with credentials.
    #[error("invalid username or password for SIP server {server}")]
    InvalidCredentials { server: String },

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// An API method was called against a call in a state that disallows it.
    /// The call is left untouched.
    #[error("{operation} is not allowed in call state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("client is already running")]
    AlreadyRunning,

    #[error("registration rejected: {0}")]
    Registration(String),

    /// The SDP offer shares no payload type with the locally supported codecs.
    #[error("no compatible codec in SDP offer")]
    NoCompatibleCodec,
}

impl From<std::io::Error> for SipError {
    fn from(e: std::io::Error) -> Self {
        SipError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SipError>;
