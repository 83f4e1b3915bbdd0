//! Client/server clock offset estimation.
//!
//! The client periodically sends its local time in a [`TimeProbe`]; the
//! server answers with its own time and echoes the probe. From the round
//! trip the client derives one raw offset sample:
//!
//! ```text
//! rtt        = now - echoed_local_timestamp
//! raw_offset = server_timestamp - echoed_local_timestamp - rtt / 2
//! ```
//!
//! Samples whose round trip is much slower than the best seen so far are
//! discarded, the rest go into a sliding window whose trimmed mean is
//! blended into the running offset with an EWMA.

use crate::config::ClockSyncConfig;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Source of local time in seconds.
pub trait TimeSource {
    fn now(&self) -> f64;
}

/// Seconds since construction, from [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(start.to_bits())),
        }
    }

    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeProbe {
    pub local_timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeReply {
    pub server_timestamp: f64,
    pub echoed_local_timestamp: f64,
}

impl TimeReply {
    pub fn answer(probe: &TimeProbe, server_timestamp: f64) -> Self {
        Self {
            server_timestamp,
            echoed_local_timestamp: probe.local_timestamp,
        }
    }
}

pub struct ClockSync<C: TimeSource> {
    clock: C,
    config: ClockSyncConfig,
    offset: f64,
    best_rtt: Option<f64>,
    last_rtt: Option<f64>,
    window: VecDeque<f64>,
    accepted: usize,
    rejected: usize,
    last_probe: Option<f64>,
}

impl<C: TimeSource> ClockSync<C> {
    pub fn new(clock: C, config: ClockSyncConfig) -> Self {
        let window = VecDeque::with_capacity(config.window);
        Self {
            clock,
            config,
            offset: 0.0,
            best_rtt: None,
            last_rtt: None,
            window,
            accepted: 0,
            rejected: 0,
            last_probe: None,
        }
    }

    pub fn local_time(&self) -> f64 {
        self.clock.now()
    }

    /// `server ≈ local + offset`
    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn server_time(&self) -> f64 {
        self.local_time() + self.offset
    }

    pub fn best_rtt(&self) -> Option<f64> {
        self.best_rtt
    }

    /// Round trip of the most recently accepted sample.
    pub fn rtt(&self) -> Option<f64> {
        self.last_rtt
    }

    pub fn accepted_samples(&self) -> usize {
        self.accepted
    }

    pub fn rejected_samples(&self) -> usize {
        self.rejected
    }

    pub fn is_stable(&self) -> bool {
        self.accepted >= self.config.warmup_samples
    }

    pub fn should_probe(&self) -> bool {
        match self.last_probe {
            Some(sent) => self.local_time() - sent >= self.config.probe_interval,
            None => true,
        }
    }

    pub fn begin_probe(&mut self) -> TimeProbe {
        let now = self.local_time();
        self.last_probe = Some(now);
        TimeProbe {
            local_timestamp: now,
        }
    }

    /// Folds a reply into the estimate. Returns the updated offset, or `None`
    /// if the sample was rejected.
    pub fn on_reply(&mut self, reply: &TimeReply) -> Option<f64> {
        let rtt = self.local_time() - reply.echoed_local_timestamp;
        if !rtt.is_finite() || rtt < 0.0 {
            debug!("Discarding time reply with invalid rtt {}", rtt);
            self.rejected += 1;
            return None;
        }

        let raw_offset = reply.server_timestamp - reply.echoed_local_timestamp - rtt / 2.0;

        let accept = match self.best_rtt {
            Some(best) => rtt <= best || rtt < best * self.config.outlier_factor,
            None => true,
        };
        self.best_rtt = Some(self.best_rtt.map_or(rtt, |best| best.min(rtt)));

        if !accept {
            debug!(
                "Rejected clock sample: rtt {:.4}s vs best {:.4}s",
                rtt,
                self.best_rtt.unwrap_or(rtt)
            );
            self.rejected += 1;
            return None;
        }

        if self.window.len() == self.config.window.max(1) {
            self.window.pop_front();
        }
        self.window.push_back(raw_offset);

        let target = trimmed_mean(&self.window, self.config.trim_fraction);
        if self.accepted == 0 {
            self.offset = target;
        } else {
            self.offset += self.config.smoothing * (target - self.offset);
        }
        self.accepted += 1;
        self.last_rtt = Some(rtt);

        Some(self.offset)
    }

    /// Whole fixed steps between `server_timestamp` and the estimated
    /// current server time.
    pub fn frames_to_rewind(&self, server_timestamp: f64, fixed_dt: f32) -> u32 {
        let elapsed = (self.server_time() - server_timestamp).max(0.0);
        (elapsed / fixed_dt as f64).round() as u32
    }

    /// Estimated one-way latency in whole fixed steps.
    pub fn frames_ahead(&self, fixed_dt: f32) -> u32 {
        let one_way = self.last_rtt.unwrap_or(0.0) / 2.0;
        (one_way / fixed_dt as f64).ceil() as u32
    }
}

/// Mean after dropping `fraction` of the samples from each end.
fn trimmed_mean(samples: &VecDeque<f64>, fraction: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);

    let len = sorted.len();
    let mut trim = (len as f64 * fraction.clamp(0.0, 0.5)).floor() as usize;
    if trim * 2 >= len {
        trim = (len - 1) / 2;
    }

    let kept = &sorted[trim..len - trim];
    kept.iter().sum::<f64>() / kept.len() as f64
}
