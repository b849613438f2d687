//! Connection establishment with a fixed-delay retry policy.
//!
//! [`ConnectState`] counts attempts and yields the delay before the next
//! one. What happens at the attempt cap is an explicit [`RetryPolicy`]:
//! `Bounded` gives up, `Unbounded` warns once and keeps going until the
//! shared keep-running flag is cleared.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use meridian_config::NetworkConfig;
pub use meridian_config::RetryPolicy;
use rand::Rng;
use tokio::net::TcpStream;

/// Configuration for connect retries.
#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    /// Attempts before the retry policy applies. Default: 10.
    pub max_attempts: u32,
    /// Delay between attempts. Default: 50 ms.
    pub retry_delay: Duration,
    /// Jitter factor (0.0–1.0) applied as ±jitter to the delay. Default: 0.
    pub jitter: f64,
    /// Behaviour at the cap. Default: [`RetryPolicy::Unbounded`].
    pub retry: RetryPolicy,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_delay: Duration::from_millis(50),
            jitter: 0.0,
            retry: RetryPolicy::Unbounded,
        }
    }
}

impl From<&NetworkConfig> for ConnectPolicy {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            max_attempts: config.max_connect_attempts,
            retry_delay: Duration::from_millis(config.connect_retry_delay_ms),
            jitter: config.connect_retry_jitter,
            retry: config.connect_retry,
        }
    }
}

/// Errors from [`connect_with_retry`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The bounded policy ran out of attempts.
    #[error("gave up after {attempts} connection attempts: {last}")]
    AttemptsExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        last: std::io::Error,
    },

    /// The keep-running flag was cleared while retrying.
    #[error("connection attempts cancelled after {attempts} tries")]
    Cancelled {
        /// Attempts made before cancellation.
        attempts: u32,
    },
}

/// Attempt counter for one connect sequence.
pub struct ConnectState {
    policy: ConnectPolicy,
    attempts: u32,
    warned: bool,
}

impl ConnectState {
    /// Create a fresh state from the given policy.
    pub fn new(policy: ConnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            warned: false,
        }
    }

    /// Record a failed attempt and return the delay before the next one, or
    /// `None` if the bounded policy is exhausted.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.attempts += 1;

        if self.attempts >= self.policy.max_attempts {
            match self.policy.retry {
                RetryPolicy::Bounded => return None,
                RetryPolicy::Unbounded if !self.warned => {
                    self.warned = true;
                    tracing::warn!(
                        attempts = self.attempts,
                        cap = self.policy.max_attempts,
                        "Exceeded max connection attempts; still retrying"
                    );
                }
                RetryPolicy::Unbounded => {}
            }
        }

        Some(self.jittered_delay())
    }

    fn jittered_delay(&self) -> Duration {
        let base = self.policy.retry_delay;
        if self.policy.jitter <= 0.0 {
            return base;
        }
        let jitter = self.policy.jitter.min(1.0);
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the over-cap warning has fired.
    pub fn warned(&self) -> bool {
        self.warned
    }
}

/// Drive `attempt` until it succeeds, the bounded policy gives up, or
/// `keep_running` is cleared.
///
/// `attempt` receives the 1-based attempt number.
pub async fn connect_with_retry<T, F, Fut>(
    policy: ConnectPolicy,
    keep_running: &AtomicBool,
    mut attempt: F,
) -> Result<T, ConnectError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let mut state = ConnectState::new(policy);
    loop {
        if !keep_running.load(Ordering::Acquire) {
            return Err(ConnectError::Cancelled {
                attempts: state.attempts(),
            });
        }

        match attempt(state.attempts() + 1).await {
            Ok(conn) => {
                if state.attempts() > 0 {
                    tracing::info!("Connected after {} failed attempts", state.attempts());
                }
                return Ok(conn);
            }
            Err(err) => {
                tracing::warn!(attempt = state.attempts() + 1, error = %err, "Connection attempt failed");
                match state.on_failure() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        return Err(ConnectError::AttemptsExhausted {
                            attempts: state.attempts(),
                            last: err,
                        });
                    }
                }
            }
        }
    }
}

/// Open a TCP stream to `host:port` under the given policy, with
/// `TCP_NODELAY` set.
pub async fn connect_tcp(
    host: &str,
    port: u16,
    policy: ConnectPolicy,
    keep_running: &AtomicBool,
) -> Result<TcpStream, ConnectError> {
    connect_with_retry(policy, keep_running, |_| async move {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    })
    .await
}
