//! Acquisition retry driver.
//!
//! One logical attempt is `arm → *OPC? → preamble → curve`, followed by a short
//! settle delay so the link can drain before the next arm. Any failure inside an
//! attempt, including a block that fails to decode, restarts the attempt from the
//! arm step. The preamble is always re-read so scale parameters never outlive the
//! capture they describe.
//!
//! By default attempts are unbounded: in the lab a human watches the hardware and
//! the scope recovers on its own. Unattended callers should use
//! [`RetryPolicy::bounded`], which turns a persistent fault into
//! [`CalError::AcquisitionExhausted`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{CalError, CalResult};
use crate::instrument::capabilities::ScopeLink;
use crate::waveform::{decode_block, RawCapture, ScaleParameters, Trace};

/// Consecutive failures between escalated warnings.
const WARN_EVERY: u32 = 10;

/// Defines how failed capture attempts are retried.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempt ceiling; `None` retries until success.
    pub max_attempts: Option<u32>,
    /// Delay between a failed attempt and the next one.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Delay after each successful raw-block read.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl RetryPolicy {
    /// Retry forever with no backoff and a 100 ms post-read settle.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            retry_delay: Duration::ZERO,
            settle_delay: Duration::from_millis(100),
        }
    }

    /// Give up after `max_attempts` failed attempts.
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::unbounded()
        }
    }

    /// Override the post-read settle delay.
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Override the delay between failed attempts.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

/// A raw capture together with the preamble read in the same attempt.
#[derive(Debug, Clone)]
pub struct Capture {
    pub raw: RawCapture,
    pub scale: ScaleParameters,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// A decoded capture.
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub trace: Trace,
    pub scale: ScaleParameters,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Counts attempts and applies the policy to each failure.
struct AttemptTracker<'a> {
    policy: &'a RetryPolicy,
    attempts: u32,
}

impl<'a> AttemptTracker<'a> {
    fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    fn begin(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    async fn failed(&self, err: CalError) -> CalResult<()> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                warn!(attempts = self.attempts, error = %err, "acquisition attempts exhausted");
                return Err(CalError::AcquisitionExhausted {
                    attempts: self.attempts,
                    last_error: err.to_string(),
                });
            }
        }

        if self.attempts % WARN_EVERY == 0 {
            warn!(attempt = self.attempts, error = %err, "scope still failing, retrying");
        } else {
            debug!(attempt = self.attempts, error = %err, "capture attempt failed, retrying");
        }

        if !self.policy.retry_delay.is_zero() {
            sleep(self.policy.retry_delay).await;
        }
        Ok(())
    }
}

/// Drives capture attempts against a [`ScopeLink`] under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct AcquisitionDriver {
    policy: RetryPolicy,
    sample_count: usize,
}

impl AcquisitionDriver {
    pub fn new(policy: RetryPolicy, sample_count: usize) -> Self {
        Self {
            policy,
            sample_count,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Run one arm/preamble/curve exchange.
    async fn attempt<L>(&self, link: &mut L) -> CalResult<(RawCapture, ScaleParameters)>
    where
        L: ScopeLink + ?Sized,
    {
        link.arm(self.sample_count)
            .await
            .map_err(CalError::instrument)?;
        link.wait_operation_complete()
            .await
            .map_err(CalError::instrument)?;
        let scale = link
            .read_scale_parameters()
            .await
            .map_err(CalError::instrument)?;
        let raw = link.read_raw_block().await.map_err(CalError::instrument)?;
        if !self.policy.settle_delay.is_zero() {
            sleep(self.policy.settle_delay).await;
        }
        Ok((raw, scale))
    }

    /// Capture a raw block and its preamble without decoding.
    pub async fn capture<L>(&self, link: &mut L) -> CalResult<Capture>
    where
        L: ScopeLink + ?Sized,
    {
        let mut tracker = AttemptTracker::new(&self.policy);
        loop {
            let attempt = tracker.begin();
            match self.attempt(link).await {
                Ok((raw, scale)) => {
                    return Ok(Capture {
                        raw,
                        scale,
                        attempts: attempt,
                    })
                }
                Err(err) => tracker.failed(err).await?,
            }
        }
    }

    /// Capture and decode a trace. Malformed blocks are re-acquired.
    pub async fn acquire_trace<L>(&self, link: &mut L) -> CalResult<Acquisition>
    where
        L: ScopeLink + ?Sized,
    {
        let mut tracker = AttemptTracker::new(&self.policy);
        loop {
            let attempt = tracker.begin();
            let decoded = match self.attempt(link).await {
                Ok((raw, scale)) => decode_block(&raw, &scale).map(|trace| (trace, scale)),
                Err(err) => Err(err),
            };
            match decoded {
                Ok((trace, scale)) => {
                    debug!(attempt, samples = trace.len(), "trace acquired");
                    return Ok(Acquisition {
                        trace,
                        scale,
                        attempts: attempt,
                    });
                }
                Err(err) => tracker.failed(err).await?,
            }
        }
    }
}
