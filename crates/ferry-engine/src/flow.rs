//! Flow control — token bucket pacing plus RTT-driven window and chunk sizing.
//!
//! One controller is owned by the sender. Each chunk costs its size in
//! tokens; the bucket refills continuously at `fill_rate`, which itself
//! adapts to how stable the measured round-trip times are. The controller is
//! advisory — retransmissions bypass it and reuse their recorded chunk size.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ferry_core::EngineConfig;

/// RTT samples kept for the rolling statistics.
const RTT_WINDOW: usize = 16;

/// Samples required before the stability heuristic replaces the bootstrap rate.
const RTT_MIN_SAMPLES: usize = 5;

/// Rolling round-trip-time statistics over a bounded sample window.
#[derive(Debug, Default)]
pub struct RttWindow {
    samples: VecDeque<f64>,
}

impl RttWindow {
    pub fn push(&mut self, rtt_ms: f64) {
        if self.samples.len() == RTT_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Max − min over the window. 0 for a single sample.
    pub fn range(&self) -> Option<f64> {
        let max = self.samples.iter().cloned().fold(f64::MIN, f64::max);
        let min = self.samples.iter().cloned().fold(f64::MAX, f64::min);
        if self.samples.is_empty() {
            None
        } else {
            Some(max - min)
        }
    }
}

/// Token-bucket pacer and RTT-driven sizing, owned by the sender engine.
#[derive(Debug)]
pub struct FlowController {
    tokens: f64,
    capacity: f64,
    fill_rate: f64,
    peak_rate: f64,
    last_refill: Instant,
    rtt: RttWindow,
    initial_window: usize,
    chunk_min: u32,
    chunk_nominal: u32,
    chunk_max: u32,
}

impl FlowController {
    pub fn new(cfg: &EngineConfig) -> Self {
        let capacity = cfg.pacing.bucket_capacity as f64;
        Self {
            tokens: capacity,
            capacity,
            fill_rate: cfg.pacing.bootstrap_rate as f64,
            peak_rate: cfg.pacing.peak_rate as f64,
            last_refill: Instant::now(),
            rtt: RttWindow::default(),
            initial_window: cfg.retry.initial_window,
            chunk_min: cfg.transfer.chunk_size_min,
            chunk_nominal: cfg.transfer.chunk_size,
            chunk_max: cfg.transfer.chunk_size_max,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.fill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Returns true if a chunk of `bytes` may be sent now, deducting its
    /// cost on success.
    pub fn can_send(&mut self, bytes: usize) -> bool {
        self.refill();
        let cost = bytes as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// How long until the bucket holds enough tokens for `bytes`.
    /// Zero if it already does.
    pub fn time_until(&mut self, bytes: usize) -> Duration {
        self.refill();
        let deficit = bytes as f64 - self.tokens;
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(deficit / self.fill_rate)
    }

    /// Record an RTT sample and re-derive the fill rate.
    ///
    /// `stability = 1 − min(range/mean, 1)`: a flat RTT window means the
    /// path is uncongested and the rate climbs toward the peak; a noisy
    /// window pulls it down. Exponentially blended so one outlier cannot
    /// swing the rate.
    pub fn observe_rtt(&mut self, rtt_ms: f64) {
        self.rtt.push(rtt_ms);

        if self.rtt.len() >= RTT_MIN_SAMPLES {
            let mean = self.rtt.mean().unwrap_or(1.0).max(f64::EPSILON);
            let range = self.rtt.range().unwrap_or(0.0);
            let stability = 1.0 - (range / mean).min(1.0);
            self.fill_rate = 0.8 * self.fill_rate + 0.2 * (stability * self.peak_rate);
            tracing::trace!(
                rtt_ms,
                mean_ms = mean,
                stability,
                fill_rate = self.fill_rate as u64,
                "rtt sample"
            );
        }
    }

    /// Rolling mean RTT in milliseconds, if any samples exist.
    pub fn mean_rtt(&self) -> Option<f64> {
        self.rtt.mean()
    }

    pub fn sample_count(&self) -> usize {
        self.rtt.len()
    }

    pub fn fill_rate(&self) -> f64 {
        self.fill_rate
    }

    /// Sliding-window size for the current RTT tier.
    pub fn window_size(&self) -> usize {
        window_for_rtt(self.rtt.mean(), self.initial_window)
    }

    /// Chunk size for the current RTT tier, clamped to the configured
    /// bounds. LAN paths get the ceiling, slow paths the floor. Applies to
    /// future chunks only — chunks already framed keep their size.
    pub fn optimal_chunk_size(&self) -> u32 {
        let size = match self.rtt.mean() {
            None => self.chunk_nominal,
            Some(rtt) if rtt < 50.0 => self.chunk_max,
            Some(rtt) if rtt < 100.0 => self.chunk_max / 2,
            Some(rtt) if rtt < 200.0 => self.chunk_nominal,
            Some(_) => self.chunk_min,
        };
        size.clamp(self.chunk_min, self.chunk_max)
    }
}

/// Window size for an RTT tier. Step-wise, not smoothed: <50 ms → 64,
/// <100 ms → 32, <200 ms → 16, else 8. `fallback` applies before any
/// samples exist. The sender feeds this its SACK-derived RTT; the receiver
/// feeds it the keepalive echo RTT to bound its reorder buffer.
pub fn window_for_rtt(mean_rtt_ms: Option<f64>, fallback: usize) -> usize {
    match mean_rtt_ms {
        None => fallback,
        Some(rtt) if rtt < 50.0 => 64,
        Some(rtt) if rtt < 100.0 => 32,
        Some(rtt) if rtt < 200.0 => 16,
        Some(_) => 8,
    }
}
