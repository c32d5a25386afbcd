//! SIP protocol: message codec, digest auth, identifiers, transport,
//! dialogs and the client itself.

pub mod client;
pub mod dialog;
pub mod digest;
pub mod ident;
pub mod message;
pub mod messages;
pub mod sdp;
pub mod transport;

pub use client::{CallHandler, Registration, RegistrationState, SipClient};
pub use digest::{DigestChallenge, DigestResponse};
pub use message::{SipMessage, SipMethod};
pub use sdp::{SdpBody, TransmitMode};
