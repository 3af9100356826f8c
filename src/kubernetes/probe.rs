//! Local port readiness probing

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

/// Dials a local address with capped exponential backoff until it connects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessProbe {
    pub initial_wait: Duration,
    pub max_wait: Duration,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_millis(50),
            max_wait: Duration::from_secs(2),
        }
    }
}

impl ReadinessProbe {
    pub fn new(initial_wait: Duration, max_wait: Duration) -> Self {
        Self {
            initial_wait,
            max_wait,
        }
    }

    /// Wait applied after each failed attempt: doubles, never above `max_wait`
    pub fn backoff(&self) -> impl Iterator<Item = Duration> {
        let max = self.max_wait;
        std::iter::successors(Some(self.initial_wait.min(max)), move |wait| {
            Some((*wait * 2).min(max))
        })
    }

    /// Returns the number of attempts it took. Retries without limit.
    pub async fn wait_until_dialable(&self, addr: SocketAddr) -> usize {
        let mut attempts = 0;
        for wait in self.backoff() {
            attempts += 1;
            match tokio::time::timeout(wait, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => {
                    tracing::debug!("{} accepted a connection after {} attempt(s)", addr, attempts);
                    return attempts;
                }
                Ok(Err(e)) => {
                    tracing::debug!("{} not dialable yet: {}", addr, e);
                }
                Err(_) => {
                    tracing::debug!("Connect to {} timed out after {:?}", addr, wait);
                }
            }
            tokio::time::sleep(wait).await;
        }
        attempts
    }
}
