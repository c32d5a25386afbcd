/// SIP Client - registration lifecycle, inbound dispatch, dialog transactions
/// Implements SIP UA behaviour over UDP per RFC 3261 (UDP subset)
///
/// One receive-loop task polls the socket non-blocking with a 10ms backoff;
/// a refresh task re-registers at expires-5s. A single async mutex (the
/// exchange lock) serialises every blocking read on the socket, so the
/// synchronous REGISTER/INVITE/SUBSCRIBE conversations never interleave
/// with the poll loop. The lock is a guard and releases on every exit path.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;

use tokio::net::lookup_host;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::{ParseError, Result, SipError};
use crate::rtp::MediaMap;
use crate::sip::dialog::{Dialog, DialogTable};
use crate::sip::digest::{DigestChallenge, DigestResponse};
use crate::sip::ident::IdentityFactory;
use crate::sip::message::{peek_status, MessageKind, Rport, SipMessage, SipMethod};
use crate::sip::messages::{
    self, InviteParams, MessageFactory, RegisterParams, SubscribeParams,
};
use crate::sip::sdp::TransmitMode;
use crate::sip::transport::{SipTransport, RECV_POLL_BACKOFF};

/// 500-class registrar responses back off this long before the retry
const SERVER_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// How many 500-class responses are tolerated before the registration
/// surfaces a transport error
const MAX_SERVER_ERROR_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    Idle,
    Registering,
    Authenticating,
    Registered,
    Refreshing,
    Deregistering,
    Failed,
}

/// Observable registration state, including the public address learned
/// from the registrar's Via when behind NAT.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub state: RegistrationState,
    pub public_ip: Option<String>,
    pub public_port: Option<u16>,
}

/// Capability interface the client calls into for everything that concerns
/// calls. Handlers run on the receive context and must not block; the
/// phone facade spawns its real work.
pub trait CallHandler: Send + Sync {
    fn on_incoming_call(&self, invite: SipMessage);
    fn on_call_progress(&self, response: SipMessage);
    fn on_call_ended(&self, message: SipMessage);
    fn on_ack(&self, _ack: SipMessage) {}
    fn on_notify(&self, _notify: SipMessage) {}
    fn on_error(&self, _error: SipError) {}
}

/// What `invite` hands back once the exchange reaches a provisional
/// response: the final serialized INVITE plus the identifiers the facade
/// tracks the call by. The 200 OK arrives later through the handler.
#[derive(Debug)]
pub struct OutboundInvite {
    pub invite: SipMessage,
    pub call_id: String,
    pub session_id: u32,
}

enum RegisterOutcome {
    Complete,
    ServerError,
}

#[derive(Clone)]
pub struct SipClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Arc<Config>,
    server_addr: SocketAddr,
    ident: IdentityFactory,
    factory: MessageFactory,
    transport: RwLock<Option<Arc<SipTransport>>>,
    /// The receive lock: whoever holds it owns the next read on the socket
    exchange: AsyncMutex<()>,
    running: AtomicBool,
    /// Set once keep-alive NOTIFYs are observed; suppresses timer refresh
    keep_alive: AtomicBool,
    registration: StdMutex<Registration>,
    dialogs: StdMutex<DialogTable>,
    handler: RwLock<Option<Weak<dyn CallHandler>>>,
    cancel: StdMutex<Option<CancellationToken>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SipClient {
    /// Resolve the registrar (or outbound proxy) and prepare the client.
    /// No socket is bound until `start`.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let target_host = config
            .proxy
            .clone()
            .unwrap_or_else(|| config.server.clone());
        let server_addr = lookup_host((target_host.as_str(), config.port))
            .await
            .map_err(|e| {
                SipError::Transport(format!("failed to resolve {}: {}", target_host, e))
            })?
            .next()
            .ok_or_else(|| {
                SipError::Transport(format!("no addresses found for {}", target_host))
            })?;

        info!("SIP peer resolved to {}", server_addr);

        let ident = IdentityFactory::new(&config.local_ip, config.local_port);
        let factory = MessageFactory::new(
            &config.username,
            &config.server,
            &config.local_ip,
            config.local_port,
            ident.urn_uuid(),
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                server_addr,
                ident,
                factory,
                transport: RwLock::new(None),
                exchange: AsyncMutex::new(()),
                running: AtomicBool::new(false),
                keep_alive: AtomicBool::new(false),
                registration: StdMutex::new(Registration::default()),
                dialogs: StdMutex::new(DialogTable::default()),
                handler: RwLock::new(None),
                cancel: StdMutex::new(None),
                tasks: StdMutex::new(Vec::new()),
            }),
        })
    }

    /// Register the call handler. Held weakly; a dropped handler behaves
    /// like no handler at all.
    pub fn set_handler(&self, handler: Weak<dyn CallHandler>) {
        *write_lock(&self.inner.handler) = Some(handler);
    }

    /// Bind the socket, register with the registrar and spawn the receive
    /// and refresh tasks.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(SipError::AlreadyRunning);
        }

        let local_ip: IpAddr = self.inner.config.local_ip.parse().map_err(|_| {
            SipError::Transport(format!(
                "local_ip {} is not an IP literal",
                self.inner.config.local_ip
            ))
        })?;
        let local = SocketAddr::new(local_ip, self.inner.config.local_port);

        let transport = match SipTransport::bind(local, self.inner.server_addr).await {
            Ok(t) => Arc::new(t),
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *write_lock(&self.inner.transport) = Some(transport);

        if let Err(e) = self.register().await {
            self.inner.running.store(false, Ordering::SeqCst);
            *write_lock(&self.inner.transport) = None;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        *mutex_lock(&self.inner.cancel) = Some(cancel.clone());
        {
            let mut tasks = mutex_lock(&self.inner.tasks);
            tasks.push(tokio::spawn(recv_loop(self.clone(), cancel.clone())));
            tasks.push(tokio::spawn(refresh_loop(self.clone(), cancel)));
        }

        info!(
            "SIP client started as {}@{}",
            self.inner.config.username, self.inner.config.server
        );
        Ok(())
    }

    /// Cancel the timers, deregister and release the socket. Safe to call
    /// twice; the second call is a no-op.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(cancel) = mutex_lock(&self.inner.cancel).take() {
            cancel.cancel();
        }
        self.inner.keep_alive.store(false, Ordering::SeqCst);

        let registered = matches!(
            self.registration().state,
            RegistrationState::Registered | RegistrationState::Refreshing
        );
        if registered {
            if let Err(e) = self.deregister().await {
                warn!("Deregistration during stop failed: {}", e);
            }
        }

        for task in mutex_lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        *write_lock(&self.inner.transport) = None;

        info!("SIP client stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn registration(&self) -> Registration {
        mutex_lock(&self.inner.registration).clone()
    }

    pub fn keep_alive_active(&self) -> bool {
        self.inner.keep_alive.load(Ordering::SeqCst)
    }

    /// Allocate a session id for a call this client did not originate.
    pub fn next_session_id(&self) -> u32 {
        self.inner.ident.session_id()
    }

    /// The address we advertise in Contact and SDP: the public mapping
    /// learned from the registrar when behind NAT, the local address
    /// otherwise.
    pub fn contact(&self) -> (String, u16) {
        let registration = mutex_lock(&self.inner.registration);
        let ip = registration
            .public_ip
            .clone()
            .unwrap_or_else(|| self.inner.config.local_ip.clone());
        let port = registration
            .public_port
            .unwrap_or(self.inner.config.local_port);
        (ip, port)
    }

    pub async fn register(&self) -> Result<()> {
        self.register_cycle(false).await
    }

    pub async fn deregister(&self) -> Result<()> {
        self.register_cycle(true).await
    }

    async fn register_cycle(&self, deregister: bool) -> Result<()> {
        let mut server_errors = 0u32;
        loop {
            match self.register_once(deregister).await? {
                RegisterOutcome::Complete => return Ok(()),
                RegisterOutcome::ServerError => {
                    server_errors += 1;
                    if server_errors >= MAX_SERVER_ERROR_RETRIES {
                        self.set_registration_state(RegistrationState::Failed);
                        return Err(SipError::Transport(format!(
                            "registrar returned server errors {} times",
                            server_errors
                        )));
                    }
                    debug!(
                        "Registrar returned a server error, retrying in {:?}",
                        SERVER_ERROR_BACKOFF
                    );
                    // The exchange lock is not held while backing off
                    tokio::time::sleep(SERVER_ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn register_once(&self, deregister: bool) -> Result<RegisterOutcome> {
        let transport = self.transport()?;
        let _guard = self.inner.exchange.lock().await;

        self.set_registration_state(match (deregister, self.registration().state) {
            (true, _) => RegistrationState::Deregistering,
            (false, RegistrationState::Registered) => RegistrationState::Refreshing,
            (false, _) => RegistrationState::Registering,
        });

        let expires = if deregister {
            0
        } else {
            self.inner.config.default_expires
        };
        let (contact_ip, contact_port) = self.contact();
        let request = self.inner.factory.register(&RegisterParams {
            branch: &self.inner.ident.branch(),
            call_id: &self.inner.ident.call_id(),
            cseq: self.inner.ident.register_cseq.next(),
            tag: self.inner.ident.register_tag(),
            expires,
            contact_ip: &contact_ip,
            contact_port,
            authorization: None,
        });

        let timeout = self.inner.config.register_timeout;
        let datagram = transport
            .send_await_final(&request, timeout, "REGISTER")
            .await?;
        let response = SipMessage::parse(&datagram)?;
        self.learn_public_address(&response);

        match response.status() {
            Some(401) => {
                self.set_registration_state(RegistrationState::Authenticating);
                let authorization = self.authorization_for(&response, "REGISTER")?;
                let (contact_ip, contact_port) = self.contact();
                let retry = self.inner.factory.register(&RegisterParams {
                    branch: &self.inner.ident.branch(),
                    call_id: &self.inner.ident.call_id(),
                    cseq: self.inner.ident.register_cseq.next(),
                    tag: self.inner.ident.register_tag(),
                    expires,
                    contact_ip: &contact_ip,
                    contact_port,
                    authorization: Some(&authorization),
                });
                let datagram = transport
                    .send_await_final(&retry, timeout, "REGISTER")
                    .await?;
                let response = SipMessage::parse(&datagram)?;
                self.learn_public_address(&response);
                match response.status() {
                    Some(401) => {
                        self.set_registration_state(RegistrationState::Failed);
                        Err(SipError::InvalidCredentials {
                            server: self.inner.config.server.clone(),
                        })
                    }
                    Some(400) => self.fail_bad_request(),
                    Some(status) if (500..600).contains(&status) => {
                        Ok(RegisterOutcome::ServerError)
                    }
                    Some(200) => {
                        self.finish_registration(deregister);
                        Ok(RegisterOutcome::Complete)
                    }
                    status => self.fail_unexpected(status),
                }
            }
            Some(400) => self.fail_bad_request(),
            Some(407) => {
                // Proxy auth is reserved; surface it rather than loop
                self.set_registration_state(RegistrationState::Failed);
                Err(SipError::Registration(
                    "proxy authentication is not supported".to_string(),
                ))
            }
            Some(status) if (500..600).contains(&status) => Ok(RegisterOutcome::ServerError),
            Some(200) => {
                self.finish_registration(deregister);
                Ok(RegisterOutcome::Complete)
            }
            status => self.fail_unexpected(status),
        }
    }

    fn fail_bad_request(&self) -> Result<RegisterOutcome> {
        // TODO: recover a broken binding with a fresh urn:uuid instance id
        self.set_registration_state(RegistrationState::Failed);
        Err(SipError::Registration("bad request".to_string()))
    }

    fn fail_unexpected(&self, status: Option<u16>) -> Result<RegisterOutcome> {
        self.set_registration_state(RegistrationState::Failed);
        Err(SipError::Registration(format!(
            "unexpected registrar response {:?}",
            status
        )))
    }

    fn finish_registration(&self, deregister: bool) {
        if deregister {
            self.set_registration_state(RegistrationState::Idle);
            info!("Deregistered from {}", self.inner.config.server);
        } else {
            self.set_registration_state(RegistrationState::Registered);
            info!(
                "Registered with {} for {}s",
                self.inner.config.server, self.inner.config.default_expires
            );
        }
    }

    /// Record received/rport from the first Via as our public address.
    /// Only active when the client is configured as behind NAT.
    fn learn_public_address(&self, response: &SipMessage) {
        if !self.inner.config.behind_nat {
            return;
        }
        let Some(via) = response.via_entries().first() else {
            return;
        };
        if let Some(received) = &via.received {
            let mut registration = mutex_lock(&self.inner.registration);
            registration.public_ip = Some(received.clone());
            if let Rport::Value(port) = via.rport {
                registration.public_port = Some(port);
            }
            debug!(
                "Public address learned from Via: {}:{:?}",
                received, registration.public_port
            );
        }
    }

    fn authorization_for(&self, response: &SipMessage, method: &str) -> Result<String> {
        let challenge = DigestChallenge::from_params(&response.authentication)
            .ok_or_else(|| SipError::Registration("unusable digest challenge".to_string()))?;
        let uri = format!("sip:{};transport=UDP", self.inner.config.server);
        let digest = DigestResponse::compute(
            &challenge,
            &self.inner.config.username,
            &self.inner.config.password,
            method,
            &uri,
        );
        Ok(digest.to_header())
    }

    /// Send an INVITE and block until the transaction reaches 100, 180 or a
    /// 401 challenge (retried once with credentials). The facade awaits the
    /// 200 OK through its handler and completes the dialog with `ack`.
    pub async fn invite(
        &self,
        number: &str,
        media: &MediaMap,
        mode: TransmitMode,
    ) -> Result<OutboundInvite> {
        let transport = self.transport()?;
        let call_id = self.inner.ident.call_id();
        let branch = self.inner.ident.branch();
        let session_id = self.inner.ident.session_id();
        let local_tag = self.inner.ident.tag();
        let (contact_ip, contact_port) = self.contact();

        mutex_lock(&self.inner.dialogs).insert(Dialog::new(&call_id, &local_tag));

        let request = self.inner.factory.invite(&InviteParams {
            number,
            session_id,
            media,
            mode,
            branch: &branch,
            call_id: &call_id,
            tag: &local_tag,
            cseq: self.inner.ident.invite_cseq.next(),
            contact_ip: &contact_ip,
            contact_port,
            authorization: None,
        });

        let _guard = self.inner.exchange.lock().await;
        transport.send(&request).await?;
        info!("Inviting {}", number);

        let deadline = tokio::time::Instant::now() + self.inner.config.register_timeout;
        let response = loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(SipError::Timeout { operation: "INVITE" });
            }
            let datagram = match transport.recv(remaining).await {
                Ok(d) => d,
                Err(SipError::Timeout { .. }) => {
                    return Err(SipError::Timeout { operation: "INVITE" })
                }
                Err(e) => return Err(e),
            };
            let message = match SipMessage::parse(&datagram) {
                Ok(m) => m,
                Err(e) => {
                    debug!("Dropping unparseable datagram during INVITE: {}", e);
                    continue;
                }
            };
            let ours = message.call_id() == Some(call_id.as_str());
            match message.status() {
                Some(100) | Some(180) | Some(401) if ours => break message,
                // Unrelated traffic takes the normal dispatch path
                _ => self.dispatch(message).await,
            }
        };

        let invite_image = if response.status() == Some(401) {
            debug!("INVITE challenged, retrying with credentials");
            let ack = self.inner.factory.ack(&response, &local_tag)?;
            transport.send(&ack).await?;

            let authorization = self.authorization_for(&response, "INVITE")?;
            let retry = self.inner.factory.invite(&InviteParams {
                number,
                session_id,
                media,
                mode,
                branch: &branch,
                call_id: &call_id,
                tag: &local_tag,
                cseq: self.inner.ident.invite_cseq.next(),
                contact_ip: &contact_ip,
                contact_port,
                authorization: Some(&authorization),
            });
            transport.send(&retry).await?;
            retry
        } else {
            debug!("INVITE proceeding with status {:?}", response.status());
            request
        };

        let invite = SipMessage::parse(invite_image.as_bytes())?;
        if let Some(dialog) = mutex_lock(&self.inner.dialogs).get_mut(&call_id) {
            dialog.last_message = Some(invite.clone());
        }

        Ok(OutboundInvite {
            invite,
            call_id,
            session_id,
        })
    }

    /// One-shot SUBSCRIBE for message-summary events, correlated to the
    /// registration by Call-ID.
    pub async fn subscribe(&self, response: &SipMessage) -> Result<()> {
        let transport = self.transport()?;
        let call_id = response
            .call_id()
            .ok_or(ParseError::MissingHeader("Call-ID"))?;
        let (contact_ip, contact_port) = self.contact();
        let request = self.inner.factory.subscribe(&SubscribeParams {
            branch: &self.inner.ident.branch(),
            call_id,
            cseq: self.inner.ident.subscribe_cseq.next(),
            tag: &self.inner.ident.tag(),
            expires: self.inner.config.default_expires * 2,
            contact_ip: &contact_ip,
            contact_port,
        });

        let _guard = self.inner.exchange.lock().await;
        transport.send(&request).await?;
        let datagram = transport.recv(self.inner.config.register_timeout).await?;
        if let Some(status) = peek_status(&datagram) {
            debug!("SUBSCRIBE answered with {}", status);
        }
        Ok(())
    }

    /// ACK a final INVITE response and fold it into the dialog.
    pub async fn ack(&self, response: &SipMessage) -> Result<()> {
        let transport = self.transport()?;
        let call_id = response
            .call_id()
            .ok_or(ParseError::MissingHeader("Call-ID"))?;

        let local_tag = {
            let mut dialogs = mutex_lock(&self.inner.dialogs);
            match dialogs.get_mut(call_id) {
                Some(dialog) => {
                    dialog.absorb(response);
                    dialog.local_tag.clone()
                }
                None => self.inner.ident.tag(),
            }
        };

        let request = self.inner.factory.ack(response, &local_tag)?;
        transport.send(&request).await
    }

    /// Send a BYE on an established dialog and retire it.
    pub async fn bye(&self, call_id: &str) -> Result<()> {
        let transport = self.transport()?;
        let (last, local_tag) = {
            let dialogs = mutex_lock(&self.inner.dialogs);
            let dialog = dialogs.get(call_id).ok_or(SipError::InvalidState {
                operation: "hangup",
                state: "no dialog",
            })?;
            let last = dialog.last_message.clone().ok_or(SipError::InvalidState {
                operation: "hangup",
                state: "no dialog",
            })?;
            (last, dialog.local_tag.clone())
        };

        let (contact_ip, contact_port) = self.contact();
        let request = self
            .inner
            .factory
            .bye(&last, &local_tag, &contact_ip, contact_port)?;
        transport.send(&request).await?;
        mutex_lock(&self.inner.dialogs).remove(call_id);
        self.inner.ident.bye_cseq.next();
        Ok(())
    }

    /// 180 Ringing for an inbound INVITE; opens the dialog and returns the
    /// local tag allocated for it.
    pub async fn send_ringing(&self, request: &SipMessage) -> Result<String> {
        let call_id = request
            .call_id()
            .ok_or(ParseError::MissingHeader("Call-ID"))?
            .to_string();
        let tag = self.inner.ident.tag();
        {
            let mut dialogs = mutex_lock(&self.inner.dialogs);
            let mut dialog = Dialog::new(&call_id, &tag);
            dialog.absorb(request);
            dialogs.insert(dialog);
        }
        let response = self.inner.factory.ringing(request, &tag)?;
        self.transport()?.send(&response).await?;
        Ok(tag)
    }

    /// 200 OK with SDP answer for an inbound INVITE.
    pub async fn send_answer(
        &self,
        request: &SipMessage,
        session_id: u32,
        media: &MediaMap,
        mode: TransmitMode,
    ) -> Result<()> {
        let call_id = request
            .call_id()
            .ok_or(ParseError::MissingHeader("Call-ID"))?;
        let tag = mutex_lock(&self.inner.dialogs)
            .local_tag(call_id)
            .map(str::to_string)
            .unwrap_or_else(|| self.inner.ident.tag());
        let (contact_ip, contact_port) = self.contact();
        let response = self.inner.factory.answer_ok(
            request,
            &tag,
            session_id,
            media,
            mode,
            &contact_ip,
            contact_port,
        )?;
        self.transport()?.send(&response).await
    }

    /// 486 Busy Here with a fresh tag.
    pub async fn send_busy(&self, request: &SipMessage) -> Result<()> {
        let response = self
            .inner
            .factory
            .busy(request, &self.inner.ident.tag())?;
        self.transport()?.send(&response).await
    }

    /// 487 Request Terminated for a cancelled INVITE.
    pub async fn send_terminated(&self, request: &SipMessage) -> Result<()> {
        let call_id = request.call_id().unwrap_or_default();
        let tag = mutex_lock(&self.inner.dialogs)
            .local_tag(call_id)
            .map(str::to_string)
            .unwrap_or_else(|| self.inner.ident.tag());
        let response = self.inner.factory.request_terminated(request, &tag)?;
        self.transport()?.send(&response).await
    }

    fn transport(&self) -> Result<Arc<SipTransport>> {
        read_lock(&self.inner.transport)
            .clone()
            .ok_or_else(|| SipError::Transport("client is not running".to_string()))
    }

    fn handler(&self) -> Option<Arc<dyn CallHandler>> {
        read_lock(&self.inner.handler).as_ref()?.upgrade()
    }

    fn set_registration_state(&self, state: RegistrationState) {
        mutex_lock(&self.inner.registration).state = state;
    }

    fn notify_error(&self, error: SipError) {
        if let Some(handler) = self.handler() {
            handler.on_error(error);
        }
    }

    async fn handle_datagram(&self, datagram: &[u8]) {
        // Registrars send zero-filled keepalive padding between messages
        if datagram.iter().all(|&b| b == 0) {
            return;
        }

        match SipMessage::parse(datagram) {
            Ok(message) => self.dispatch(message).await,
            Err(ParseError::UnsupportedVersion(version)) => {
                warn!("Rejecting message with version {}", version);
                let raw = String::from_utf8_lossy(datagram);
                let response = messages::version_not_supported(&raw, &self.inner.ident.tag());
                if let Ok(transport) = self.transport() {
                    if let Err(e) = transport.send(&response).await {
                        warn!("Failed to send 505: {}", e);
                    }
                }
            }
            Err(e) => debug!("Dropping unparseable datagram: {}", e),
        }
    }

    async fn dispatch(&self, message: SipMessage) {
        match message.kind.clone() {
            MessageKind::Response { status, .. } => {
                self.dispatch_response(status, message).await
            }
            MessageKind::Request { method } => self.dispatch_request(method, message).await,
        }
    }

    async fn dispatch_response(&self, status: u16, message: SipMessage) {
        if status == 100 {
            trace!("100 Trying");
            return;
        }

        if let Some(call_id) = message.call_id() {
            if let Some(dialog) = mutex_lock(&self.inner.dialogs).get_mut(call_id) {
                dialog.absorb(&message);
            }
        }

        match self.handler() {
            Some(handler) => handler.on_call_progress(message),
            None => debug!("Response {} arrived with no handler registered", status),
        }
    }

    async fn dispatch_request(&self, method: SipMethod, message: SipMessage) {
        match method {
            SipMethod::Invite => match self.handler() {
                Some(handler) => handler.on_incoming_call(message),
                None => {
                    debug!("No call handler registered, answering busy");
                    if let Err(e) = self.send_busy(&message).await {
                        warn!("486 reply failed: {}", e);
                    }
                }
            },
            SipMethod::Bye => {
                if let Some(handler) = self.handler() {
                    handler.on_call_ended(message.clone());
                }
                // The reply goes to the server path either way; a direct
                // peer route may be unreachable behind NAT
                self.reply_ok(&message).await;
                if let Some(call_id) = message.call_id() {
                    mutex_lock(&self.inner.dialogs).remove(call_id);
                }
            }
            SipMethod::Ack => {
                if let Some(call_id) = message.call_id() {
                    if let Some(dialog) = mutex_lock(&self.inner.dialogs).get_mut(call_id) {
                        dialog.absorb(&message);
                    }
                }
                if let Some(handler) = self.handler() {
                    handler.on_ack(message);
                }
            }
            SipMethod::Cancel => {
                if let Some(handler) = self.handler() {
                    handler.on_call_ended(message.clone());
                }
                self.reply_ok(&message).await;
            }
            SipMethod::Notify => {
                if message.event().map(|e| e.starts_with("keep-alive")) == Some(true)
                    && !self.inner.keep_alive.swap(true, Ordering::SeqCst)
                {
                    info!("Keep-alive NOTIFYs observed; timer refresh suppressed");
                }
                if let Some(handler) = self.handler() {
                    handler.on_notify(message.clone());
                }
                match self.inner.factory.notify_ok(&message) {
                    Ok(response) => {
                        if let Ok(transport) = self.transport() {
                            if let Err(e) = transport.send(&response).await {
                                warn!("NOTIFY reply failed: {}", e);
                            }
                        }
                    }
                    Err(e) => warn!("Could not build NOTIFY reply: {}", e),
                }
            }
            SipMethod::Options => debug!("Ignoring OPTIONS request"),
            other => {
                // TODO: answer unhandled methods with 400 Bad Request
                debug!("No handler for {} request", other.as_str());
            }
        }
    }

    async fn reply_ok(&self, request: &SipMessage) {
        let tag = request
            .call_id()
            .and_then(|call_id| {
                mutex_lock(&self.inner.dialogs)
                    .local_tag(call_id)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| self.inner.ident.tag());
        match self.inner.factory.ok(request, &tag) {
            Ok(response) => {
                if let Ok(transport) = self.transport() {
                    if let Err(e) = transport.send(&response).await {
                        warn!("200 OK reply failed: {}", e);
                    }
                }
            }
            Err(e) => warn!("Could not build 200 OK reply: {}", e),
        }
    }
}

/// Poll the socket under the exchange lock; back off briefly when idle.
async fn recv_loop(client: SipClient, cancel: CancellationToken) {
    debug!("Receive loop started");
    let mut buf = vec![0u8; 8192];

    while !cancel.is_cancelled() && client.inner.running.load(Ordering::SeqCst) {
        let received = {
            let _guard = client.inner.exchange.lock().await;
            let Ok(transport) = client.transport() else {
                break;
            };
            match transport.try_recv(&mut buf) {
                Ok(Some(len)) => {
                    let datagram = buf[..len].to_vec();
                    client.handle_datagram(&datagram).await;
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    error!("Receive loop transport error: {}", e);
                    client.notify_error(e);
                    break;
                }
            }
        };

        if !received {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RECV_POLL_BACKOFF) => {}
            }
        }
    }
    debug!("Receive loop exited");
}

/// Re-register at expires-5s unless keep-alive NOTIFYs make it redundant.
async fn refresh_loop(client: SipClient, cancel: CancellationToken) {
    let period = Duration::from_secs(
        client.inner.config.default_expires.saturating_sub(5) as u64
    );
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        if !client.inner.running.load(Ordering::SeqCst) {
            break;
        }
        if client.inner.keep_alive.load(Ordering::SeqCst) {
            debug!("Keep-alive active; skipping timer-driven refresh");
            continue;
        }
        debug!("Refreshing registration");
        if let Err(e) = client.register().await {
            error!("Registration refresh failed: {}", e);
            client.notify_error(e);
            break;
        }
    }
    debug!("Refresh loop exited");
}

fn mutex_lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
