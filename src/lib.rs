//! sipline - a SIP softphone core
//!
//! A user agent that registers with a SIP registrar over UDP, keeps the
//! registration alive, and places and accepts voice calls carried over
//! RTP with G.711 audio.
//!
//! The programmatic surface is [`phone::VoipPhone`]: `start`, `stop`,
//! `call`, and per-call `answer`/`hangup` with an observable state.

pub mod config;
pub mod error;
pub mod phone;
pub mod rtp;
pub mod sip;

pub use config::Config;
pub use error::{ParseError, SipError};
pub use phone::{Call, CallDirection, CallState, VoipPhone};
pub use sip::SipClient;

/// Product identity carried in User-Agent and SDP session names.
pub const USER_AGENT: &str = concat!("sipline/", env!("CARGO_PKG_VERSION"));
