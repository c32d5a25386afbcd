/// Phone facade - owns the SIP client and the table of active calls
///
/// Inbound INVITEs are answered with 180 Ringing, wrapped in a Call and
/// handed to the application callback on their own task. Outbound calls
/// come back from `call()` in DIALING and complete asynchronously when the
/// 200 OK arrives. All state is observable through a watch channel, which
/// is what makes `wait_answered` possible.

#[cfg(test)]
mod model;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::{ParseError, Result, SipError};
use crate::rtp::session::{allocate_ports, negotiate, MediaPorts, MediaSession, NegotiatedMedia};
use crate::rtp::{default_offer, MediaMap, PayloadKind};
use crate::sip::client::{CallHandler, OutboundInvite, SipClient};
use crate::sip::message::{SipMessage, SipMethod};
use crate::sip::sdp::TransmitMode;

/// Call lifecycle per the SIP flows: outbound calls dial, both directions
/// ring, and every path ends in exactly one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Dialing,
    Ringing,
    Answered,
    Ended,
    Busy,
    Canceled,
    Error,
}

impl CallState {
    pub fn name(&self) -> &'static str {
        match self {
            CallState::Dialing => "DIALING",
            CallState::Ringing => "RINGING",
            CallState::Answered => "ANSWERED",
            CallState::Ended => "ENDED",
            CallState::Busy => "BUSY",
            CallState::Canceled => "CANCELED",
            CallState::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Ended | CallState::Busy | CallState::Canceled | CallState::Error
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// One voice call bound to one media session. Handed to the application
/// as an Arc; it stays alive until the application releases it and the
/// dialog terminates.
pub struct Call {
    call_id: String,
    session_id: u32,
    direction: CallDirection,
    state: watch::Sender<CallState>,
    client: SipClient,
    config: Arc<Config>,
    /// The inbound INVITE request, or our own outbound INVITE
    invite: StdMutex<Option<SipMessage>>,
    pending_ports: StdMutex<Option<MediaPorts>>,
    pending_negotiated: StdMutex<Option<NegotiatedMedia>>,
    media: StdMutex<Option<MediaSession>>,
}

impl Call {
    fn new_inbound(
        invite: SipMessage,
        session_id: u32,
        client: SipClient,
        config: Arc<Config>,
    ) -> Self {
        let call_id = invite.call_id().unwrap_or_default().to_string();
        Self {
            call_id,
            session_id,
            direction: CallDirection::Inbound,
            state: watch::channel(CallState::Ringing).0,
            client,
            config,
            invite: StdMutex::new(Some(invite)),
            pending_ports: StdMutex::new(None),
            pending_negotiated: StdMutex::new(None),
            media: StdMutex::new(None),
        }
    }

    fn new_outbound(
        outbound: OutboundInvite,
        ports: MediaPorts,
        client: SipClient,
        config: Arc<Config>,
    ) -> Self {
        Self {
            call_id: outbound.call_id,
            session_id: outbound.session_id,
            direction: CallDirection::Outbound,
            state: watch::channel(CallState::Dialing).0,
            client,
            config,
            invite: StdMutex::new(Some(outbound.invite)),
            pending_ports: StdMutex::new(Some(ports)),
            pending_negotiated: StdMutex::new(None),
            media: StdMutex::new(None),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    /// Await the transition into ANSWERED. Resolves with an error when the
    /// call lands in a terminal state or the timeout passes first.
    pub async fn wait_answered(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(timeout, async move {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    CallState::Answered => return Ok(()),
                    s if s.is_terminal() => {
                        return Err(SipError::InvalidState {
                            operation: "wait_answered",
                            state: s.name(),
                        })
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(SipError::InvalidState {
                        operation: "wait_answered",
                        state: "ERROR",
                    });
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(SipError::Timeout {
                operation: "wait_answered",
            }),
        }
    }

    /// Answer an inbound ringing call: negotiate the offer, allocate media
    /// ports, send 200 with the SDP answer and wait for the peer's ACK.
    pub async fn answer(&self) -> Result<()> {
        if self.direction != CallDirection::Inbound || self.state() != CallState::Ringing {
            return Err(SipError::InvalidState {
                operation: "answer",
                state: self.state().name(),
            });
        }

        let invite = mutex_lock(&self.invite)
            .clone()
            .ok_or(SipError::InvalidState {
                operation: "answer",
                state: "ERROR",
            })?;
        let sdp = invite
            .body
            .clone()
            .ok_or_else(|| ParseError::malformed("INVITE", "no SDP offer"))?;
        let negotiated = negotiate(&sdp)?;

        let ports = allocate_ports(self.config.rtp_port_low, self.config.rtp_port_high).await?;
        let answer_media = negotiated_media_map(ports.port, &negotiated);

        *mutex_lock(&self.pending_ports) = Some(ports);
        *mutex_lock(&self.pending_negotiated) = Some(negotiated);

        self.client
            .send_answer(&invite, self.session_id, &answer_media, TransmitMode::SendRecv)
            .await?;
        debug!("Answered call {}, awaiting ACK", self.call_id);

        // The ACK lands on the receive loop, which completes the answer
        let mut rx = self.state.subscribe();
        let acked = tokio::time::timeout(self.config.register_timeout, async move {
            loop {
                if *rx.borrow_and_update() == CallState::Answered {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;

        match acked {
            Ok(true) => Ok(()),
            Ok(false) => Err(SipError::InvalidState {
                operation: "answer",
                state: self.state().name(),
            }),
            Err(_) => Err(SipError::Timeout { operation: "ACK" }),
        }
    }

    /// Hang up an answered call with a BYE.
    pub async fn hangup(&self) -> Result<()> {
        if self.state() != CallState::Answered {
            return Err(SipError::InvalidState {
                operation: "hangup",
                state: self.state().name(),
            });
        }
        self.client.bye(&self.call_id).await?;
        self.teardown(CallState::Ended);
        info!("Call {} hung up", self.call_id);
        Ok(())
    }

    /// Queue PCM audio towards the peer.
    pub fn write_audio(&self, samples: &[i16]) -> Result<()> {
        match mutex_lock(&self.media).as_ref() {
            Some(session) => {
                session.write_audio(samples);
                Ok(())
            }
            None => Err(SipError::InvalidState {
                operation: "write_audio",
                state: self.state().name(),
            }),
        }
    }

    /// Read up to `max` decoded PCM samples received from the peer.
    pub fn read_audio(&self, max: usize) -> Result<Vec<i16>> {
        match mutex_lock(&self.media).as_ref() {
            Some(session) => Ok(session.read_audio(max)),
            None => Err(SipError::InvalidState {
                operation: "read_audio",
                state: self.state().name(),
            }),
        }
    }

    /// Next DTMF digit the peer sent, if any.
    pub fn read_dtmf(&self) -> Option<char> {
        mutex_lock(&self.media).as_ref()?.read_dtmf()
    }

    fn set_state(&self, state: CallState) {
        self.state.send_replace(state);
    }

    fn invite_message(&self) -> Option<SipMessage> {
        mutex_lock(&self.invite).clone()
    }

    /// Bring up the RTP session from the pre-allocated ports.
    fn start_media(&self, negotiated: NegotiatedMedia) -> Result<()> {
        let ports = mutex_lock(&self.pending_ports)
            .take()
            .ok_or(SipError::InvalidState {
                operation: "start media",
                state: self.state().name(),
            })?;
        let session = MediaSession::start(
            ports,
            negotiated,
            TransmitMode::SendRecv,
            self.config.transmit_delay_reduction,
        );
        *mutex_lock(&self.media) = Some(session);
        Ok(())
    }

    /// The peer's ACK arrived for our 200: start media and go ANSWERED.
    fn complete_answer(&self) {
        let Some(negotiated) = mutex_lock(&self.pending_negotiated).take() else {
            return;
        };
        match self.start_media(negotiated) {
            Ok(()) => self.set_state(CallState::Answered),
            Err(e) => {
                error!("Media start failed for {}: {}", self.call_id, e);
                self.teardown(CallState::Error);
            }
        }
    }

    /// Release the media session and settle into a terminal state. Runs on
    /// every way a call can end.
    fn teardown(&self, state: CallState) {
        if let Some(session) = mutex_lock(&self.media).take() {
            session.stop();
        }
        *mutex_lock(&self.pending_ports) = None;
        *mutex_lock(&self.pending_negotiated) = None;
        self.set_state(state);
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("call_id", &self.call_id)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

/// Application callback for inbound calls. Runs on its own task; it may
/// block for the duration of the call.
pub type IncomingCallCallback = dyn Fn(Arc<Call>) + Send + Sync;

pub struct VoipPhone {
    core: Arc<PhoneCore>,
}

pub struct PhoneCore {
    config: Arc<Config>,
    client: SipClient,
    calls: StdMutex<HashMap<String, Arc<Call>>>,
    callback: Option<Arc<IncomingCallCallback>>,
    self_ref: Weak<PhoneCore>,
}

impl VoipPhone {
    /// Build the phone around a resolved SIP client. The callback, when
    /// present, is invoked once per inbound call.
    pub async fn new(
        config: Arc<Config>,
        callback: Option<Arc<IncomingCallCallback>>,
    ) -> Result<Self> {
        let client = SipClient::new(config.clone()).await?;
        let core = Arc::new_cyclic(|weak| PhoneCore {
            config,
            client,
            calls: StdMutex::new(HashMap::new()),
            callback,
            self_ref: weak.clone(),
        });
        let handler: Weak<dyn CallHandler> = core.self_ref.clone();
        core.client.set_handler(handler);
        Ok(Self { core })
    }

    pub async fn start(&self) -> Result<()> {
        self.core.client.start().await
    }

    /// Hang up whatever is still alive and shut the client down.
    pub async fn stop(&self) -> Result<()> {
        let calls: Vec<Arc<Call>> = mutex_lock(&self.core.calls).drain().map(|(_, c)| c).collect();
        for call in calls {
            if call.state() == CallState::Answered {
                if let Err(e) = call.hangup().await {
                    warn!("Hangup during stop failed: {}", e);
                    call.teardown(CallState::Ended);
                }
            } else if !call.state().is_terminal() {
                call.teardown(CallState::Ended);
            }
        }
        self.core.client.stop().await
    }

    /// Place an outbound call. Returns in DIALING; await `wait_answered`
    /// or poll `state` for progress.
    pub async fn call(&self, number: &str) -> Result<Arc<Call>> {
        let ports =
            allocate_ports(self.core.config.rtp_port_low, self.core.config.rtp_port_high).await?;
        let offer = default_offer(ports.port);
        let outbound = self
            .core
            .client
            .invite(number, &offer, TransmitMode::SendRecv)
            .await?;

        let call = Arc::new(Call::new_outbound(
            outbound,
            ports,
            self.core.client.clone(),
            self.core.config.clone(),
        ));
        mutex_lock(&self.core.calls).insert(call.call_id().to_string(), call.clone());
        info!("Dialing {} (call {})", number, call.call_id());
        Ok(call)
    }

    /// Calls that have not yet reached a terminal state.
    pub fn active_calls(&self) -> Vec<Arc<Call>> {
        let mut calls = mutex_lock(&self.core.calls);
        calls.retain(|_, call| !call.state().is_terminal());
        calls.values().cloned().collect()
    }

    pub fn client(&self) -> &SipClient {
        &self.core.client
    }
}

impl PhoneCore {
    fn call_for(&self, message: &SipMessage) -> Option<Arc<Call>> {
        let call_id = message.call_id()?;
        mutex_lock(&self.calls).get(call_id).cloned()
    }

    async fn handle_incoming(self: Arc<Self>, invite: SipMessage) {
        let Some(callback) = self.callback.clone() else {
            debug!("No application callback configured, declining call");
            if let Err(e) = self.client.send_busy(&invite).await {
                warn!("486 reply failed: {}", e);
            }
            return;
        };

        let Some(call_id) = invite.call_id().map(str::to_string) else {
            return;
        };
        let caller = invite
            .from_header()
            .and_then(|f| f.user.clone())
            .unwrap_or_else(|| "unknown".to_string());

        if let Err(e) = self.client.send_ringing(&invite).await {
            error!("180 Ringing failed for {}: {}", call_id, e);
            return;
        }

        let call = Arc::new(Call::new_inbound(
            invite,
            self.client.next_session_id(),
            self.client.clone(),
            self.config.clone(),
        ));
        mutex_lock(&self.calls).insert(call_id.clone(), call.clone());
        info!("Incoming call {} from {}", call_id, caller);

        // We are already on a spawned task; the callback may block
        callback(call);
    }

    async fn handle_progress(self: Arc<Self>, response: SipMessage) {
        let Some(call) = self.call_for(&response) else {
            trace!("Response for unknown call dropped");
            return;
        };
        let Some(status) = response.status() else {
            return;
        };
        // Only INVITE-transaction responses drive call state
        match response.cseq() {
            Some((_, method)) if method == "INVITE" => {}
            _ => return,
        }

        match status {
            180 | 183 => {
                if call.state() == CallState::Dialing {
                    call.set_state(CallState::Ringing);
                }
            }
            200 => {
                if call.direction() == CallDirection::Outbound
                    && matches!(call.state(), CallState::Dialing | CallState::Ringing)
                {
                    if let Err(e) = self.complete_outbound(&call, &response).await {
                        error!("Completing call {} failed: {}", call.call_id(), e);
                        call.teardown(CallState::Error);
                    }
                }
            }
            401 | 407 => {
                // The client already retried once with credentials
                error!("Call {} rejected: authentication failed", call.call_id());
                let _ = self.client.ack(&response).await;
                call.teardown(CallState::Error);
            }
            486 | 600 | 603 => {
                let _ = self.client.ack(&response).await;
                call.teardown(CallState::Busy);
                info!("Call {} busy", call.call_id());
            }
            487 => {
                let _ = self.client.ack(&response).await;
                call.teardown(CallState::Canceled);
            }
            status if status >= 400 => {
                let _ = self.client.ack(&response).await;
                call.teardown(CallState::Error);
                warn!("Call {} failed with status {}", call.call_id(), status);
            }
            _ => {}
        }
    }

    async fn complete_outbound(&self, call: &Arc<Call>, response: &SipMessage) -> Result<()> {
        let sdp = response
            .body
            .clone()
            .ok_or_else(|| ParseError::malformed("200 OK", "no SDP answer"))?;
        let negotiated = negotiate(&sdp)?;
        self.client.ack(response).await?;
        call.start_media(negotiated)?;
        call.set_state(CallState::Answered);
        info!("Call {} answered", call.call_id());
        Ok(())
    }

    async fn handle_ended(self: Arc<Self>, message: SipMessage) {
        let Some(call) = self.call_for(&message) else {
            return;
        };
        match message.method() {
            Some(SipMethod::Bye) => {
                call.teardown(CallState::Ended);
                mutex_lock(&self.calls).remove(call.call_id());
                info!("Call {} ended by peer", call.call_id());
            }
            Some(SipMethod::Cancel) => {
                if call.state() == CallState::Ringing {
                    if let Some(invite) = call.invite_message() {
                        if let Err(e) = self.client.send_terminated(&invite).await {
                            warn!("487 reply failed: {}", e);
                        }
                    }
                    call.teardown(CallState::Canceled);
                    mutex_lock(&self.calls).remove(call.call_id());
                    info!("Call {} canceled by peer", call.call_id());
                }
            }
            _ => {}
        }
    }

    fn handle_ack(self: Arc<Self>, ack: SipMessage) {
        let Some(call) = self.call_for(&ack) else {
            return;
        };
        if call.direction() == CallDirection::Inbound && call.state() == CallState::Ringing {
            call.complete_answer();
        }
    }
}

impl CallHandler for PhoneCore {
    fn on_incoming_call(&self, invite: SipMessage) {
        let Some(core) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(core.handle_incoming(invite));
    }

    fn on_call_progress(&self, response: SipMessage) {
        let Some(core) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(core.handle_progress(response));
    }

    fn on_call_ended(&self, message: SipMessage) {
        let Some(core) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(core.handle_ended(message));
    }

    fn on_ack(&self, ack: SipMessage) {
        let Some(core) = self.self_ref.upgrade() else {
            return;
        };
        core.handle_ack(ack);
    }

    fn on_notify(&self, notify: SipMessage) {
        debug!(
            "NOTIFY event {:?} on call {:?}",
            notify.event(),
            notify.call_id()
        );
    }

    fn on_error(&self, error: SipError) {
        error!("SIP client error: {}", error);
    }
}

/// The answer media map: the negotiated audio payload plus the peer's
/// telephone-event payload when offered.
fn negotiated_media_map(port: u16, negotiated: &NegotiatedMedia) -> MediaMap {
    let mut codecs = std::collections::BTreeMap::new();
    let kind = match negotiated.codec {
        crate::rtp::G711Codec::ULaw => PayloadKind::Pcmu,
        crate::rtp::G711Codec::ALaw => PayloadKind::Pcma,
    };
    codecs.insert(negotiated.payload_type, kind);
    if let Some(dtmf) = negotiated.dtmf_payload_type {
        codecs.insert(dtmf, PayloadKind::TelephoneEvent);
    }
    let mut map = std::collections::BTreeMap::new();
    map.insert(port, codecs);
    map
}

fn mutex_lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn test_config() -> Arc<Config> {
        let mut map = StdHashMap::new();
        map.insert("SIP_SERVER", "203.0.113.1");
        map.insert("SIP_USERNAME", "alice");
        map.insert("SIP_PASSWORD", "secret");
        Arc::new(Config::from_map(&map).unwrap())
    }

    async fn test_client() -> SipClient {
        SipClient::new(test_config()).await.unwrap()
    }

    fn inbound_invite() -> SipMessage {
        let body = "v=0\r\n\
                    o=bob 1 2 IN IP4 203.0.113.9\r\n\
                    s=-\r\n\
                    c=IN IP4 203.0.113.9\r\n\
                    t=0 0\r\n\
                    m=audio 7078 RTP/AVP 0 101\r\n\
                    a=rtpmap:0 PCMU/8000\r\n\
                    a=rtpmap:101 telephone-event/8000\r\n";
        let data = format!(
            "INVITE sip:alice@example.net SIP/2.0\r\n\
             Via: SIP/2.0/UDP 203.0.113.9:5060;branch=z9hG4bKcall\r\n\
             From: \"Bob\" <sip:bob@example.net>;tag=remote1\r\n\
             To: <sip:alice@example.net>\r\n\
             Call-ID: in1@203.0.113.9:5060\r\n\
             CSeq: 1 INVITE\r\n\
             Contact: <sip:bob@203.0.113.9:5060>\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        SipMessage::parse(data.as_bytes()).unwrap()
    }

    #[test]
    fn test_state_names() {
        assert_eq!(CallState::Dialing.name(), "DIALING");
        assert_eq!(CallState::Answered.name(), "ANSWERED");
        assert_eq!(CallState::Canceled.name(), "CANCELED");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!CallState::Dialing.is_terminal());
        assert!(!CallState::Ringing.is_terminal());
        assert!(!CallState::Answered.is_terminal());
        assert!(CallState::Ended.is_terminal());
        assert!(CallState::Busy.is_terminal());
        assert!(CallState::Canceled.is_terminal());
        assert!(CallState::Error.is_terminal());
    }

    #[tokio::test]
    async fn test_inbound_call_starts_ringing() {
        let call = Call::new_inbound(inbound_invite(), 1, test_client().await, test_config());
        assert_eq!(call.state(), CallState::Ringing);
        assert_eq!(call.direction(), CallDirection::Inbound);
        assert_eq!(call.call_id(), "in1@203.0.113.9:5060");
    }

    #[tokio::test]
    async fn test_hangup_rejected_unless_answered() {
        let call = Call::new_inbound(inbound_invite(), 1, test_client().await, test_config());
        let err = call.hangup().await.unwrap_err();
        assert!(matches!(
            err,
            SipError::InvalidState {
                operation: "hangup",
                state: "RINGING"
            }
        ));
        // No side effect on state
        assert_eq!(call.state(), CallState::Ringing);
    }

    #[tokio::test]
    async fn test_answer_rejected_on_outbound_state() {
        let call = Call::new_inbound(inbound_invite(), 1, test_client().await, test_config());
        call.set_state(CallState::Ended);
        let err = call.answer().await.unwrap_err();
        assert!(matches!(err, SipError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_audio_io_requires_media() {
        let call = Call::new_inbound(inbound_invite(), 1, test_client().await, test_config());
        assert!(matches!(
            call.write_audio(&[0i16; 160]),
            Err(SipError::InvalidState { .. })
        ));
        assert!(matches!(
            call.read_audio(160),
            Err(SipError::InvalidState { .. })
        ));
        assert!(call.read_dtmf().is_none());
    }

    #[tokio::test]
    async fn test_teardown_is_terminal_and_idempotent() {
        let call = Call::new_inbound(inbound_invite(), 1, test_client().await, test_config());
        call.teardown(CallState::Canceled);
        assert_eq!(call.state(), CallState::Canceled);
        call.teardown(CallState::Ended);
        assert_eq!(call.state(), CallState::Ended);
    }

    #[tokio::test]
    async fn test_wait_answered_resolves_on_transition() {
        let call = Arc::new(Call::new_inbound(
            inbound_invite(),
            1,
            test_client().await,
            test_config(),
        ));

        let waiter = {
            let call = call.clone();
            tokio::spawn(async move { call.wait_answered(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        call.set_state(CallState::Answered);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_answered_fails_on_terminal() {
        let call = Arc::new(Call::new_inbound(
            inbound_invite(),
            1,
            test_client().await,
            test_config(),
        ));

        let waiter = {
            let call = call.clone();
            tokio::spawn(async move { call.wait_answered(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        call.set_state(CallState::Busy);

        let result = waiter.await.unwrap();
        assert!(matches!(
            result,
            Err(SipError::InvalidState { state: "BUSY", .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_answered_times_out() {
        let call = Call::new_inbound(inbound_invite(), 1, test_client().await, test_config());
        let result = call.wait_answered(Duration::from_millis(30)).await;
        assert!(matches!(result, Err(SipError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_phone_tracks_active_calls() {
        let phone = VoipPhone::new(test_config(), None).await.unwrap();
        let call = Arc::new(Call::new_inbound(
            inbound_invite(),
            1,
            phone.client().clone(),
            test_config(),
        ));
        mutex_lock(&phone.core.calls).insert(call.call_id().to_string(), call.clone());

        assert_eq!(phone.active_calls().len(), 1);
        call.teardown(CallState::Ended);
        assert_eq!(phone.active_calls().len(), 0);
    }

    #[test]
    fn test_negotiated_media_map_includes_dtmf() {
        let negotiated = NegotiatedMedia {
            payload_type: 8,
            codec: crate::rtp::G711Codec::ALaw,
            dtmf_payload_type: Some(96),
            remote: "203.0.113.9:7078".parse().unwrap(),
        };
        let map = negotiated_media_map(10000, &negotiated);
        let codecs = map.get(&10000).unwrap();
        assert_eq!(codecs.get(&8), Some(&PayloadKind::Pcma));
        assert_eq!(codecs.get(&96), Some(&PayloadKind::TelephoneEvent));
    }
}
