//! Rill scaling heuristics: a trend-based scale monitor voting over trailing
//! metric samples, and a target scaler converting pending work into a desired
//! worker-instance count.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tracing::debug;

use rill_core::TriggerMetrics;
use rill_metrics::{MetricsError, MetricsProvider};

/// Scale recommendation from a trailing sample window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    None,
    ScaleIn,
    ScaleOut,
}

#[derive(Debug, Clone)]
pub struct ScaleMonitorConfig {
    /// Per-instance capacity: pending work one worker is expected to absorb.
    pub max_work_per_instance: i64,
    /// Minimum trailing samples required before voting at all.
    pub min_sample_count: usize,
}

impl Default for ScaleMonitorConfig {
    fn default() -> Self {
        Self { max_work_per_instance: 1000, min_sample_count: 5 }
    }
}

/// Evaluates a trailing window of metric samples into a scale vote.
///
/// Rules, on the last `min_sample_count` samples in chronological order:
/// 1. pending on the newest sample is positive, pending never decreased
///    across the window and the newest sample is at or above the
///    per-instance capacity -> `ScaleOut`;
/// 2. pending never increased across the window and there was a net
///    decrease -> `ScaleIn`;
/// 3. otherwise steady -> `None`.
///
/// Rule 1 is checked before rule 2. A flat window votes `None`: the net
/// decrease requirement in rule 2 keeps an unchanging (possibly idle) series
/// from reading as a scale-in trend.
pub struct ScaleMonitor {
    provider: MetricsProvider,
    cfg: ScaleMonitorConfig,
}

impl ScaleMonitor {
    pub fn new(provider: MetricsProvider, cfg: ScaleMonitorConfig) -> Self {
        Self { provider, cfg }
    }

    pub async fn get_metrics(&self) -> Result<TriggerMetrics, MetricsError> {
        self.provider.get_metrics().await
    }

    /// Vote over an explicit sample window (chronological order).
    pub fn vote(&self, samples: &[TriggerMetrics], worker_count: usize) -> Vote {
        let vote = evaluate(samples, &self.cfg);
        if vote == Vote::None && samples.len() >= self.cfg.min_sample_count {
            debug!(key = %self.provider.key(), worker_count, "load is steady");
        }
        vote
    }

    /// Vote over the provider's recorded history.
    pub fn vote_from_history(&self, worker_count: usize) -> Vote {
        self.vote(&self.provider.history(), worker_count)
    }
}

/// Pure vote evaluation, exposed for the CLI and tests.
pub fn evaluate(samples: &[TriggerMetrics], cfg: &ScaleMonitorConfig) -> Vote {
    // Not enough evidence to vote either way.
    if samples.len() < cfg.min_sample_count {
        return Vote::None;
    }
    let window = &samples[samples.len() - cfg.min_sample_count..];
    let newest = &window[window.len() - 1];

    if newest.pending_events > 0 {
        let growing_at_capacity = pairs_hold(window, |prev, next| {
            prev.pending_events <= next.pending_events
                && next.pending_events >= cfg.max_work_per_instance
        });
        if growing_at_capacity {
            return Vote::ScaleOut;
        }
    }

    let declining = pairs_hold(window, |prev, next| prev.pending_events >= next.pending_events)
        && newest.pending_events < window[0].pending_events;
    if declining {
        return Vote::ScaleIn;
    }

    Vote::None
}

fn pairs_hold(
    window: &[TriggerMetrics],
    pred: impl Fn(&TriggerMetrics, &TriggerMetrics) -> bool,
) -> bool {
    window.windows(2).all(|pair| pred(&pair[0], &pair[1]))
}

#[derive(Debug, Clone)]
pub struct TargetScalerConfig {
    pub max_work_per_instance: i64,
    pub max_instance_count: u32,
}

impl Default for TargetScalerConfig {
    fn default() -> Self {
        Self { max_work_per_instance: 1000, max_instance_count: 3 }
    }
}

/// Computes `ceil(total_work / capacity)`, floored at one worker and capped
/// at the configured maximum. Pathological work counts saturate instead of
/// wrapping.
pub struct TargetScaler {
    provider: MetricsProvider,
    cfg: TargetScalerConfig,
}

impl TargetScaler {
    pub fn new(provider: MetricsProvider, cfg: TargetScalerConfig) -> Self {
        Self { provider, cfg }
    }

    pub async fn get_target_worker_count(&self) -> Result<u32, MetricsError> {
        let metrics = self.provider.get_metrics().await?;
        let total = metrics.pending_events.saturating_add(metrics.processing_events);
        let target = target_for(total, &self.cfg);
        debug!(key = %self.provider.key(), total, target, "target worker count");
        Ok(target)
    }
}

/// Pure target computation, exposed for the CLI and tests.
pub fn target_for(total_work: i64, cfg: &TargetScalerConfig) -> u32 {
    let per_instance = cfg.max_work_per_instance.max(1);
    let work = total_work.max(0);
    // div/rem form avoids the overflow of `work + per_instance - 1`.
    let desired = work / per_instance + i64::from(work % per_instance != 0);
    let desired = u32::try_from(desired.max(1)).unwrap_or(u32::MAX);
    desired.min(cfg.max_instance_count)
}
