//! Proxy-side roles and their supervisor
//!
//! Both proxy roles dial out to the gateway, authenticate into their session
//! slot and then multiplex flows until the tunnel dies. The supervisor owns
//! the reconnect loop: any non-auth failure tears everything down, waits out
//! a jittered exponential backoff and tries again. Auth rejection is
//! terminal.

mod client;
mod server;

pub use client::run_proxy_client;
pub use server::run_proxy_server;

use crate::protocol::{Message, Role, AUTH_TIMEOUT};
use crate::transport::TunnelStream;
use crate::tunnel::FramedConnection;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// First reconnect delay
pub const RECONNECT_MIN: Duration = Duration::from_secs(3);

/// Reconnect delay ceiling
pub const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// How one tunnel attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunEnd {
    /// Gateway rejected the credentials; do not retry
    AuthFailed,
    /// External shutdown; GoAway sent and the tunnel drained
    Shutdown,
    /// The gateway evicted us in favour of a newer peer; stop cleanly
    Evicted,
    /// Tunnel lost for any other reason; reconnect after backoff
    Lost,
}

/// Exponential backoff with ±20% jitter
pub(crate) struct Backoff {
    next: Duration,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self {
            next: RECONNECT_MIN,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.next = RECONNECT_MIN;
    }

    pub(crate) fn delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(RECONNECT_MAX);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        base.mul_f64(jitter)
    }
}

/// Reconnect loop shared by both proxy roles
///
/// `attempt` runs one full connect-auth-pump cycle and reports how it ended.
pub(crate) async fn supervise<F, Fut>(
    label: &str,
    cancel: &CancellationToken,
    mut attempt: F,
) -> crate::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RunEnd>,
{
    let mut backoff = Backoff::new();
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let started = Instant::now();
        match attempt().await {
            RunEnd::AuthFailed => {
                error!(role = label, "authentication rejected by gateway, giving up");
                return Err(crate::Error::AuthenticationFailed);
            }
            RunEnd::Shutdown => {
                info!(role = label, "shut down");
                return Ok(());
            }
            RunEnd::Evicted => {
                info!(role = label, "evicted by a newer peer, stopping");
                return Ok(());
            }
            RunEnd::Lost => {
                // A tunnel that held for a while earns a fresh backoff
                if started.elapsed() > RECONNECT_MAX {
                    backoff.reset();
                }
                let delay = backoff.delay();
                info!(role = label, delay_ms = delay.as_millis() as u64, "reconnecting");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Outcome of the authentication exchange
pub(crate) enum AuthOutcome {
    Ok,
    Rejected,
    Lost,
}

/// Send Authenticate and wait for the gateway's verdict
pub(crate) async fn authenticate(
    conn: &mut FramedConnection<TunnelStream>,
    session_id: i32,
    role: Role,
    password: &str,
) -> AuthOutcome {
    let auth = Message::Authenticate {
        session_id,
        role,
        password: password.as_bytes().to_vec(),
    };
    if conn.sender().send(auth.encode()).is_err() {
        return AuthOutcome::Lost;
    }

    let frame = match timeout(AUTH_TIMEOUT, conn.receive()).await {
        Err(_) => {
            warn!("no auth response within deadline");
            return AuthOutcome::Lost;
        }
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) | Ok(Err(_)) => return AuthOutcome::Lost,
    };

    match Message::decode(&frame) {
        Ok(Message::AuthOk) => AuthOutcome::Ok,
        Ok(Message::AuthFailed) => AuthOutcome::Rejected,
        Ok(other) => {
            warn!(?other, "unexpected message during authentication");
            AuthOutcome::Lost
        }
        Err(e) => {
            warn!(error = %e, "malformed auth response");
            AuthOutcome::Lost
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = Backoff::new();
        let mut bases = Vec::new();
        for _ in 0..6 {
            bases.push(b.next);
            b.delay();
        }
        assert_eq!(bases[0], Duration::from_secs(3));
        assert_eq!(bases[1], Duration::from_secs(6));
        assert_eq!(bases[2], Duration::from_secs(12));
        assert_eq!(bases[3], Duration::from_secs(24));
        assert_eq!(bases[4], Duration::from_secs(30));
        assert_eq!(bases[5], Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        for _ in 0..100 {
            let mut b = Backoff::new();
            let d = b.delay();
            assert!(d >= Duration::from_secs_f64(3.0 * 0.8));
            assert!(d <= Duration::from_secs_f64(3.0 * 1.2));
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut b = Backoff::new();
        b.delay();
        b.delay();
        b.reset();
        assert_eq!(b.next, RECONNECT_MIN);
    }
}
