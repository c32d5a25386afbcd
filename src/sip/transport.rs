/// SIP UDP Transport Layer
/// Handles sending and receiving SIP messages over UDP
///
/// Synchronous exchanges use RFC 3261 Timer A retransmission:
/// - Timer A starts at T1 (500ms), doubles each retransmit
/// - The caller's overall exchange timeout plays the role of Timer B
/// - Retransmission stops on any provisional response

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::SipError;
use crate::sip::message::peek_status;

/// RFC 3261 Timer T1 - RTT estimate (500ms default)
pub const T1: Duration = Duration::from_millis(500);

/// How long the receive loop backs off when the socket is empty
pub const RECV_POLL_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct SipTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl SipTransport {
    /// Bind the local endpoint; the socket family follows the local IP.
    /// All sends go to `peer` (the outbound proxy when configured,
    /// otherwise the registrar).
    pub async fn bind(local: SocketAddr, peer: SocketAddr) -> Result<Self, SipError> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| SipError::Transport(format!("failed to bind {}: {}", local, e)))?;

        debug!(
            "SIP transport bound to {}, peer {}",
            socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            peer
        );

        Ok(Self {
            socket: Arc::new(socket),
            peer,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SipError> {
        self.socket
            .local_addr()
            .map_err(|e| SipError::Transport(e.to_string()))
    }

    /// Send a SIP message to the peer
    pub async fn send(&self, message: &str) -> Result<(), SipError> {
        trace!("Sending SIP message:\n{}", message);

        self.socket
            .send_to(message.as_bytes(), self.peer)
            .await
            .map_err(|e| SipError::Transport(format!("send failed: {}", e)))?;

        Ok(())
    }

    /// Non-blocking receive for the poll loop; None when the socket is empty.
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<Option<usize>, SipError> {
        match self.socket.try_recv_from(buf) {
            Ok((len, _addr)) => Ok(Some(len)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(SipError::Transport(format!("recv failed: {}", e))),
        }
    }

    /// Receive one datagram with a timeout
    pub async fn recv(&self, timeout_duration: Duration) -> Result<Vec<u8>, SipError> {
        let mut buf = [0u8; 8192];

        let result = timeout(timeout_duration, self.socket.recv_from(&mut buf))
            .await
            .map_err(|_| SipError::Timeout {
                operation: "receive",
            })?;

        let (len, _addr) =
            result.map_err(|e| SipError::Transport(format!("recv failed: {}", e)))?;
        trace!(
            "Received SIP message:\n{}",
            String::from_utf8_lossy(&buf[..len])
        );

        Ok(buf[..len].to_vec())
    }

    /// Send a request and wait for its final (>= 200) response, with Timer A
    /// retransmission until the first provisional arrives and `overall`
    /// bounding the whole exchange.
    pub async fn send_await_final(
        &self,
        request: &str,
        overall: Duration,
        operation: &'static str,
    ) -> Result<Vec<u8>, SipError> {
        let start = tokio::time::Instant::now();
        let mut timer_a = T1;
        let mut retransmit_count = 0u32;
        let mut in_proceeding = false; // True after receiving 1xx

        self.send(request).await?;
        debug!("Sent {} (initial), Timer A = {:?}", operation, timer_a);

        loop {
            let elapsed = start.elapsed();
            if elapsed >= overall {
                return Err(SipError::Timeout { operation });
            }
            let remaining = overall - elapsed;
            let wait_time = timer_a.min(remaining);

            match self.recv(wait_time).await {
                Ok(datagram) => {
                    match peek_status(&datagram) {
                        Some(code) if code >= 200 => {
                            debug!(
                                "Received final response {} after {} retransmits",
                                code, retransmit_count
                            );
                            return Ok(datagram);
                        }
                        Some(code) => {
                            // Provisional - stop retransmitting, wait out the
                            // rest of the exchange window
                            debug!("Received provisional response {}", code);
                            in_proceeding = true;
                            timer_a = overall.saturating_sub(start.elapsed());
                        }
                        None => {
                            // Not a response; a request that raced the
                            // exchange will be retransmitted by its sender
                            trace!("Dropping non-response datagram during exchange");
                        }
                    }
                }
                Err(SipError::Timeout { .. }) => {
                    if !in_proceeding {
                        retransmit_count += 1;
                        if start.elapsed() >= overall {
                            return Err(SipError::Timeout { operation });
                        }
                        warn!(
                            "{} timeout, retransmitting (attempt {}, Timer A = {:?})",
                            operation,
                            retransmit_count + 1,
                            timer_a
                        );
                        self.send(request).await?;
                        timer_a = timer_a.saturating_mul(2);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
