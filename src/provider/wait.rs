// src/provider/wait.rs

//! Bounded polling helpers shared by provider implementations.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::errors::{Result, SpotrunError};

/// A timeout expressed as a number of fixed polling intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollBudget {
    /// Split `timeout` into polls of `interval`; always at least one poll.
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            Duration::from_secs(1)
        } else {
            interval
        };
        let attempts = timeout.as_millis().div_ceil(interval.as_millis()).max(1);
        Self {
            interval,
            max_attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        }
    }

    pub fn total(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Poll `addr:port` until a TCP connection succeeds or the budget runs out.
pub async fn wait_for_tcp_port(ip: &str, port: u16, budget: PollBudget) -> Result<()> {
    let connect_timeout = budget.interval.max(Duration::from_millis(100));

    for attempt in 1..=budget.max_attempts {
        let connect = TcpStream::connect((ip, port));
        match tokio::time::timeout(connect_timeout, connect).await {
            Ok(Ok(_stream)) => {
                debug!(ip = %ip, port, attempt, "port accepting connections");
                return Ok(());
            }
            Ok(Err(e)) => debug!(ip = %ip, port, attempt, error = %e, "port not ready"),
            Err(_) => debug!(ip = %ip, port, attempt, "connect attempt timed out"),
        }
        if attempt < budget.max_attempts {
            tokio::time::sleep(budget.interval).await;
        }
    }

    Err(SpotrunError::Timeout {
        what: format!("port {port} on {ip}"),
        after_secs: budget.total().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_rounds_up_and_never_hits_zero() {
        let b = PollBudget::new(Duration::from_secs(300), Duration::from_secs(5));
        assert_eq!(b.max_attempts, 60);
        let b = PollBudget::new(Duration::from_secs(7), Duration::from_secs(5));
        assert_eq!(b.max_attempts, 2);
        let b = PollBudget::new(Duration::ZERO, Duration::from_secs(5));
        assert_eq!(b.max_attempts, 1);
    }

    #[tokio::test]
    async fn open_port_is_detected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let budget = PollBudget::new(Duration::from_secs(1), Duration::from_millis(100));
        wait_for_tcp_port("127.0.0.1", port, budget).await.unwrap();
    }

    #[tokio::test]
    async fn closed_port_times_out() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let budget = PollBudget::new(Duration::from_millis(200), Duration::from_millis(100));
        let err = wait_for_tcp_port("127.0.0.1", port, budget).await.unwrap_err();
        assert!(matches!(err, SpotrunError::Timeout { .. }));
    }
}
