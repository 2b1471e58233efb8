/*
 * Meeting Minutes Pipeline - LLM Orchestrator
 * Copyright (c) 2024 Meeting Minutes Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, PipelineResult};
use crate::providers::{LlmOptions, LlmOutput, LlmProvider};
use crate::template::PromptPair;

/// Generic bounded-retry policy: exponential backoff with jitter, applied
/// only to transient error kinds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub jitter_frac: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            jitter_frac: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given retry (1-based): base, base*factor, ...
    /// with ±jitter applied.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let raw = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::from_secs_f64(raw * jitter_factor(self.jitter_frac))
    }
}

/// Multiplier in `[1 - frac, 1 + frac]`, seeded from the clock's
/// sub-second nanos.
fn jitter_factor(frac: f64) -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let unit = (nanos % 1_000) as f64 / 1_000.0;
    1.0 - frac + 2.0 * frac * unit
}

/// Drives the LLM provider with the bounded-retry policy. Deterministic
/// failures surface immediately; `CONTEXT_LENGTH` gets one retry with the
/// completion budget halved.
pub struct LlmOrchestrator {
    provider: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
}

impl LlmOrchestrator {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(provider: Arc<dyn LlmProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    pub async fn generate(
        &self,
        prompt: &PromptPair,
        opts: &LlmOptions,
        cancel: &CancellationToken,
    ) -> PipelineResult<LlmOutput> {
        let mut opts = opts.clone();
        let mut transient_attempts = 0u32;
        let mut halved = false;

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let result = self
                .provider
                .complete(&prompt.system, &prompt.user, &opts, cancel)
                .await;

            let error = match result {
                Ok(output) => {
                    tracing::debug!(
                        "llm '{}' completed with {} tokens",
                        self.provider.name(),
                        output.usage_tokens
                    );
                    return Ok(output);
                }
                Err(e) => e,
            };

            if matches!(error, PipelineError::Cancelled) {
                return Err(error);
            }

            if matches!(error, PipelineError::ContextLength(_)) && !halved {
                halved = true;
                opts.max_tokens = (opts.max_tokens / 2).max(1);
                tracing::warn!(
                    "llm context overflow; retrying once with max_tokens={}",
                    opts.max_tokens
                );
                continue;
            }

            transient_attempts += 1;
            if !error.is_transient() || transient_attempts >= self.policy.max_attempts {
                return Err(error);
            }

            let delay = self.policy.delay_for(transient_attempts);
            tracing::warn!(
                "llm attempt {transient_attempts} failed ({}); retrying in {:.1}s",
                error.code(),
                delay.as_secs_f64()
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
