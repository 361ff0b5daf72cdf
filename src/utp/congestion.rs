//! LEDBAT congestion control and RTT estimation
//!
//! LEDBAT steers the send window from one-way delay measurements instead
//! of loss: every inbound packet carries the sender's clock, the receiver
//! measures how far above the 120-second baseline the delay has drifted,
//! and the window grows or shrinks proportionally. Retransmission timing
//! uses Jacobson/Karels smoothing with a hard 500 ms floor.

use std::time::{Duration, Instant};

use super::packet::MAX_PACKET_SIZE;

/// Window gain per round trip, in packets
pub const MAX_CWND_INCREASE_PACKETS_PER_RTT: f64 = 8.0;

/// Retransmission timeout floor (microseconds)
pub const RTO_FLOOR_MICROS: u64 = 500_000;

/// Retransmission timeout ceiling under exponential backoff (microseconds)
pub const RTO_CEIL_MICROS: u64 = 60_000_000;

/// How long a base-delay observation stays valid
pub const BASE_DELAY_WINDOW: Duration = Duration::from_secs(120);

/// Minimum one-way delay observed within the rolling window
#[derive(Debug, Clone, Copy)]
struct BaseDelay {
    delay_micros: u32,
    observed_at: Instant,
}

/// Congestion controller state for one socket.
#[derive(Debug)]
pub struct LedbatController {
    /// Allowed in-flight bytes. Held as f64 so fractional gains
    /// accumulate instead of truncating to zero.
    max_window: f64,

    /// Smoothed round-trip time (microseconds)
    rtt_micros: u64,

    /// Round-trip time mean deviation (microseconds)
    rtt_var_micros: u64,

    /// Current retransmission timeout (microseconds)
    rto_micros: u64,

    /// Whether an RTT sample has been absorbed yet
    has_rtt_sample: bool,

    /// Rolling minimum one-way delay
    base_delay: Option<BaseDelay>,
}

impl LedbatController {
    pub fn new(initial_window: u32) -> Self {
        Self {
            max_window: initial_window as f64,
            rtt_micros: 0,
            rtt_var_micros: 0,
            rto_micros: RTO_FLOOR_MICROS,
            has_rtt_sample: false,
            base_delay: None,
        }
    }

    /// Current send window in bytes
    pub fn window(&self) -> u32 {
        self.max_window as u32
    }

    /// Smoothed RTT estimate in microseconds
    pub fn rtt_micros(&self) -> u64 {
        self.rtt_micros
    }

    /// Current retransmission timeout
    pub fn rto(&self) -> Duration {
        Duration::from_micros(self.rto_micros)
    }

    pub fn rto_micros(&self) -> u64 {
        self.rto_micros
    }

    /// Absorb a round-trip sample measured against an acked packet's
    /// send timestamp.
    pub fn on_rtt_sample(&mut self, packet_rtt_micros: u64) {
        if !self.has_rtt_sample {
            self.rtt_micros = packet_rtt_micros;
            self.rtt_var_micros = packet_rtt_micros / 2;
            self.has_rtt_sample = true;
        } else {
            let delta = self.rtt_micros as i64 - packet_rtt_micros as i64;
            let var = self.rtt_var_micros as i64 + (delta.abs() - self.rtt_var_micros as i64) / 4;
            self.rtt_var_micros = var.max(0) as u64;
            let rtt = self.rtt_micros as i64
                + (packet_rtt_micros as i64 - self.rtt_micros as i64) / 8;
            self.rtt_micros = rtt.max(0) as u64;
        }

        self.rto_micros = (self.rtt_micros + 4 * self.rtt_var_micros)
            .clamp(RTO_FLOOR_MICROS, RTO_CEIL_MICROS);
    }

    /// Absorb a one-way delay sample from an inbound packet and adjust
    /// the window.
    ///
    /// `cur_window` is the sender's current in-flight byte count; an idle
    /// or receive-only socket contributes a zero window factor and leaves
    /// the window untouched.
    pub fn on_delay_sample(&mut self, delay_micros: u32, cur_window: u32, now: Instant) {
        let our_delay = match self.base_delay {
            Some(base) => delay_micros as i64 - base.delay_micros as i64,
            None => 0,
        };

        let expired = self
            .base_delay
            .map(|base| now.duration_since(base.observed_at) > BASE_DELAY_WINDOW)
            .unwrap_or(true);
        if expired || delay_micros < self.base_delay.map(|b| b.delay_micros).unwrap_or(u32::MAX) {
            self.base_delay = Some(BaseDelay {
                delay_micros,
                observed_at: now,
            });
        }

        let base = match self.base_delay {
            Some(base) if base.delay_micros > 0 => base.delay_micros as f64,
            _ => return,
        };

        // Positive off-target means delay is below target: grow
        let off_target = base - our_delay as f64;
        let delay_factor = off_target / base;
        let window_factor = if self.max_window > 0.0 {
            cur_window as f64 / self.max_window
        } else {
            0.0
        };
        let scaled_gain = MAX_CWND_INCREASE_PACKETS_PER_RTT * delay_factor * window_factor;

        self.max_window = (self.max_window + scaled_gain).max(0.0);
    }

    /// Retransmission timeout fired: collapse the window to a single
    /// packet and double the timeout.
    pub fn on_timeout(&mut self) {
        self.max_window = MAX_PACKET_SIZE as f64;
        self.rto_micros = (self.rto_micros * 2).min(RTO_CEIL_MICROS);
    }
}
