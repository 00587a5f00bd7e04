//! TCP readiness probe for freshly spawned backends

use crate::error::RouteError;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Upper bound for a single connect attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Growth factor applied to the delay after every failed attempt
const BACKOFF_FACTOR: f64 = 1.5;

/// Retry budget and initial delay for readiness probing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeConfig {
    /// Retries after the first failed connect; the prober makes
    /// `retries + 1` connect attempts in total (see [`ProbeConfig::attempts`])
    pub retries: u32,
    /// Delay before the first retry; each later delay is 1.5x the previous one
    pub initial_delay: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(1000),
        }
    }
}

impl ProbeConfig {
    /// Total connect attempts before giving up
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// The delays slept between attempts when nothing ever listens
    pub fn delays(&self) -> Vec<Duration> {
        let mut delay = self.initial_delay;
        (0..self.retries)
            .map(|_| {
                let current = delay;
                delay = delay.mul_f64(BACKOFF_FACTOR);
                current
            })
            .collect()
    }
}

/// Wait until `host:port` accepts a TCP connection.
///
/// The probe connection is closed immediately on success. Returns
/// [`RouteError::Timeout`] once the retry budget is exhausted.
pub async fn probe(host: &str, port: u16, config: &ProbeConfig) -> Result<(), RouteError> {
    let addr = format!("{}:{}", host, port);
    probe_with(config, || connect_once(&addr)).await
}

async fn connect_once(addr: &str) -> io::Result<()> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
    }
}

/// Drive the retry loop with an arbitrary connect attempt
pub(crate) async fn probe_with<F, Fut>(config: &ProbeConfig, mut attempt: F) -> Result<(), RouteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    let mut remaining = config.retries;
    let mut delay = config.initial_delay;

    loop {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) if remaining == 0 => {
                debug!(error = %e, attempts = config.attempts(), "Readiness probe exhausted");
                return Err(RouteError::Timeout);
            }
            Err(e) => {
                debug!(error = %e, remaining, delay_ms = delay.as_millis() as u64, "Backend not listening yet");
                tokio::time::sleep(delay).await;
                remaining -= 1;
                delay = delay.mul_f64(BACKOFF_FACTOR);
            }
        }
    }
}
