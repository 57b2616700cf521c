//! Backoff schedule for re-opening the push connection.
//!
//! The connection task owns one [`Backoff`] per outage: each failed attempt
//! waits the next delay in the schedule, and a fresh outage starts again
//! from [`ReconnectConfig::initial_delay`].

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::connection::{PushConnector, PushStream};

/// Delay schedule for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    /// Delays never exceed this.
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Position within a [`ReconnectConfig`] schedule.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    upcoming: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            upcoming: config.initial_delay.min(config.max_delay),
            config,
            attempts: 0,
        }
    }

    /// Failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt and return how long to wait before the next.
    pub fn fail(&mut self) -> Duration {
        self.attempts += 1;
        let wait = self.upcoming;
        let grown = wait.as_secs_f64() * self.config.multiplier;
        self.upcoming = Duration::try_from_secs_f64(grown)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay);
        wait
    }
}

/// Retry `connector` until it connects or `cancel` fires.
pub async fn reconnect(
    connector: &PushConnector,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<PushStream> {
    let mut backoff = Backoff::new(config.clone());

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return None,
            attempt = connector.connect() => attempt,
        };

        let error = match attempt {
            Ok(stream) => {
                tracing::info!(
                    ws_url = connector.ws_url(),
                    failed_attempts = backoff.attempts(),
                    "Push connection restored",
                );
                return Some(stream);
            }
            Err(e) => e,
        };

        let wait = backoff.fail();
        tracing::warn!(
            ws_url = connector.ws_url(),
            attempt = backoff.attempts(),
            retry_in_ms = wait.as_millis() as u64,
            error = %error,
            "Push connection attempt failed",
        );

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(config: ReconnectConfig, n: usize) -> Vec<u64> {
        let mut backoff = Backoff::new(config);
        (0..n).map(|_| backoff.fail().as_secs()).collect()
    }

    #[test]
    fn default_schedule_doubles_then_caps() {
        assert_eq!(
            schedule(ReconnectConfig::default(), 8),
            vec![1, 2, 4, 8, 16, 30, 30, 30]
        );
    }

    #[test]
    fn custom_multiplier() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 3.0,
        };
        assert_eq!(schedule(config, 4), vec![2, 6, 18, 54]);
    }

    #[test]
    fn initial_delay_above_max_is_clamped() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(90),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(schedule(config, 2), vec![10, 10]);
    }

    #[test]
    fn attempts_are_counted() {
        let mut backoff = Backoff::new(ReconnectConfig::default());
        backoff.fail();
        backoff.fail();
        assert_eq!(backoff.attempts(), 2);
    }

    #[tokio::test]
    async fn cancelled_reconnect_gives_up() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let connector = PushConnector::new("ws://127.0.0.1:1", "client");
        assert!(reconnect(&connector, &ReconnectConfig::default(), &cancel)
            .await
            .is_none());
    }
}
