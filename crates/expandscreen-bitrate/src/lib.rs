//! expandscreen-bitrate — smoothed AIMD bitrate control.
//!
//! Each `ProtocolFeedback` from the handheld produces one decision:
//! additive increase while the link is healthy, multiplicative decrease on
//! loss or RTT pressure, the result capped under the observed receive rate
//! (with headroom) and smoothed so the encoder is not thrashed. Changes
//! below the hysteresis band are not published at all.

use expandscreen_protocol::ProtocolFeedback;
use tracing::debug;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BitrateConfig {
    pub min_bps: u64,
    pub max_bps: u64,
    pub increase_step_bps: u64,
    pub decrease_factor: f64,
    pub smoothing_alpha: f64,
    pub bandwidth_headroom: f64,
    pub loss_decrease_threshold: f64,
    pub rtt_decrease_threshold_ms: f64,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            min_bps: 500_000,
            max_bps: 12_000_000,
            increase_step_bps: 250_000,
            decrease_factor: 0.75,
            smoothing_alpha: 0.2,
            bandwidth_headroom: 0.85,
            loss_decrease_threshold: 0.01,
            rtt_decrease_threshold_ms: 200.0,
        }
    }
}

// ── Decision ──────────────────────────────────────────────────────────────────

/// Output of one feedback round. `changed == false` means the smoothed
/// value stayed inside the hysteresis band and the previous target stands.
#[derive(Debug, Clone, PartialEq)]
pub struct BitrateDecision {
    pub target_bps: u64,
    pub changed: bool,
    pub reason: String,
    pub loss: f64,
    pub estimated_bandwidth_bps: Option<u64>,
    pub average_rtt_ms: f64,
}

/// Changes smaller than this are suppressed to avoid oscillation.
const HYSTERESIS_BPS: u64 = 50_000;

// ── Controller ────────────────────────────────────────────────────────────────

/// Stateful controller; one instance per device session. Pure and
/// synchronous: feed it feedback, get a decision.
#[derive(Debug)]
pub struct BitrateController {
    config: BitrateConfig,
    current_bps: f64,
}

impl BitrateController {
    pub fn new(config: BitrateConfig, initial_bps: u64) -> Self {
        let initial = (initial_bps.clamp(config.min_bps, config.max_bps)) as f64;
        Self { config, current_bps: initial }
    }

    pub fn current_bps(&self) -> u64 {
        self.current_bps.round() as u64
    }

    pub fn on_feedback(&mut self, feedback: &ProtocolFeedback) -> BitrateDecision {
        let cfg = &self.config;

        let total = feedback.total_messages_delta + feedback.dropped_messages_delta;
        let loss = if total > 0 && feedback.dropped_messages_delta > 0 {
            feedback.dropped_messages_delta as f64 / total as f64
        } else {
            0.0
        };

        let (mut raw, reason) = if loss >= cfg.loss_decrease_threshold {
            (
                (self.current_bps * cfg.decrease_factor).max(cfg.min_bps as f64),
                format!("loss {:.1}%", loss * 100.0),
            )
        } else if feedback.average_rtt_ms >= cfg.rtt_decrease_threshold_ms {
            (
                (self.current_bps * cfg.decrease_factor).max(cfg.min_bps as f64),
                format!("rtt {:.0}ms", feedback.average_rtt_ms),
            )
        } else {
            (
                (self.current_bps + cfg.increase_step_bps as f64).min(cfg.max_bps as f64),
                "stable".to_owned(),
            )
        };

        let estimated_bandwidth =
            (feedback.receive_rate_bps > 0).then_some(feedback.receive_rate_bps);
        if let Some(bw) = estimated_bandwidth {
            raw = raw.min(bw as f64 * cfg.bandwidth_headroom);
        }
        raw = raw.clamp(cfg.min_bps as f64, cfg.max_bps as f64);

        let smoothed = (self.current_bps * (1.0 - cfg.smoothing_alpha) + raw * cfg.smoothing_alpha)
            .clamp(cfg.min_bps as f64, cfg.max_bps as f64);

        let changed = smoothed.round() as i64 - self.current_bps.round() as i64;
        let changed = changed.unsigned_abs() >= HYSTERESIS_BPS;
        if changed {
            debug!(
                "bitrate {} -> {} ({reason})",
                self.current_bps.round() as u64,
                smoothed.round() as u64
            );
            self.current_bps = smoothed;
        }

        BitrateDecision {
            target_bps: self.current_bps.round() as u64,
            changed,
            reason,
            loss,
            estimated_bandwidth_bps: estimated_bandwidth,
            average_rtt_ms: feedback.average_rtt_ms,
        }
    }
}
