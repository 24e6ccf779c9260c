//! Readiness probe for freshly launched nodes
//!
//! Fixed-interval TCP dialing: node boot time is roughly constant, so the
//! total wait is `delay * (max_retries + 1)` bounded by the deadline.

use crate::error::{ManagerError, ManagerResult};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info};

/// Dial `endpoint` until it accepts a connection.
///
/// Makes one initial attempt plus up to `max_retries` retries, each bounded
/// by `delay`, sleeping `delay` between attempts. The deadline is checked
/// before every attempt and while sleeping. The returned stream is only
/// proof of reachability; callers should drop it.
pub async fn dial_with_retry(
    endpoint: &str,
    max_retries: u32,
    delay: Duration,
    deadline: Instant,
) -> ManagerResult<TcpStream> {
    let mut attempts = 0u32;
    let mut last_error = None;

    for attempt in 0..=max_retries {
        if Instant::now() >= deadline {
            return Err(ManagerError::Cancelled {
                endpoint: endpoint.to_string(),
                attempts,
            });
        }

        attempts += 1;
        let attempt_timeout = delay.min(deadline.saturating_duration_since(Instant::now()));
        match timeout(attempt_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => {
                info!(endpoint = %endpoint, attempts, "Endpoint reachable");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!(endpoint = %endpoint, attempt = attempts, error = %e, "Dial failed");
                last_error = Some(e);
            }
            Err(_) => {
                debug!(endpoint = %endpoint, attempt = attempts, "Dial timed out");
                last_error = Some(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect timed out after {attempt_timeout:?}"),
                ));
            }
        }

        if attempt < max_retries {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = sleep_until(deadline) => {
                    return Err(ManagerError::Cancelled {
                        endpoint: endpoint.to_string(),
                        attempts,
                    });
                }
            }
        }
    }

    Err(ManagerError::DialExhausted {
        endpoint: endpoint.to_string(),
        attempts,
        source: last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "no dial attempt was made")
        }),
    })
}
