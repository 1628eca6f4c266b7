//! CUBIC congestion control with a Reno floor (§4.4).
//!
//! State is per-path. The controller is driven purely by notifications
//! (`acknowledgement`, `ecn_ec`, `repeat`, `timeout`, `spurious_repeat`,
//! `rtt_measurement`); it never reaches back into the packet/connection
//! layers. Represented as a variant tag rather than a trait object (Design
//! Notes §9), so a different congestion discipline could be substituted by
//! re-dispatching in one place without virtual calls on the hot path.

use crate::{CWIN_INITIAL, CWIN_MINIMUM, MIN_MAX_RTT_SCOPE, SSTHRESH_INFINITE, TARGET_RENO_RTT_US};

/// Assumed maximum segment size used throughout the CUBIC formulas.
pub const MTU: u64 = 1460;
/// CUBIC's window-growth-aggressiveness constant.
pub const CUBIC_C: f64 = 0.4;
/// Multiplicative decrease factor applied on loss.
pub const CUBIC_BETA: f64 = 7.0 / 8.0;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AlgState {
    SlowStart,
    Recovery,
    CongestionAvoidance,
}

/// What provoked a call into the controller. `EcnEc`/`Repeat`/`Timeout` are
/// the three loss-signal notifications; they share a recovery-entry path
/// but diverge in the non-timeout/timeout cases of `enter_recovery`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LossSignal {
    EcnEc,
    Repeat,
    Timeout,
}

/// A small fixed-size ring tracking the last `MIN_MAX_RTT_SCOPE` RTT
/// samples, with a running filtered minimum, for the HyStart slow-start
/// exit test. No allocation (Design Notes §9).
pub struct HyStart {
    samples: [u64; MIN_MAX_RTT_SCOPE],
    len: usize,
    next: usize,
    filtered_min: u64,
    nb_rtt_excess: u32,
    last_sample_time: u64,
}

impl HyStart {
    pub fn new() -> Self {
        Self {
            samples: [0; MIN_MAX_RTT_SCOPE],
            len: 0,
            next: 0,
            filtered_min: 0,
            nb_rtt_excess: 0,
            last_sample_time: 0,
        }
    }

    /// Record one RTT sample (at most once per millisecond, per §4.4) and
    /// report whether this sample trips the HyStart exit test.
    pub fn on_sample(&mut self, now_us: u64, rtt_us: u64) -> bool {
        if now_us.saturating_sub(self.last_sample_time) < 1_000 && self.last_sample_time != 0 {
            return false;
        }
        self.last_sample_time = now_us;

        self.samples[self.next] = rtt_us;
        self.next = (self.next + 1) % MIN_MAX_RTT_SCOPE;
        self.len = (self.len + 1).min(MIN_MAX_RTT_SCOPE);

        let mut sample_min = u64::MAX;
        let mut sample_max = 0u64;
        for i in 0..self.len {
            let s = self.samples[i];
            sample_min = sample_min.min(s);
            sample_max = sample_max.max(s);
        }

        if sample_max < self.filtered_min || self.filtered_min == 0 {
            self.filtered_min = sample_max;
        }

        if sample_min > self.filtered_min && (sample_min - self.filtered_min) * 4 > self.filtered_min {
            self.nb_rtt_excess += 1;
            if self.nb_rtt_excess as usize >= MIN_MAX_RTT_SCOPE {
                return true;
            }
        } else {
            self.nb_rtt_excess = 0;
        }
        false
    }
}

impl Default for HyStart {
    fn default() -> Self {
        Self::new()
    }
}

/// Bracket-and-Newton cube root (§4.4): seed `y=1, v=1`, double/halve until
/// `v ≤ x < 8v`, then three Newton iterations.
pub fn cube_root(x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let mut y = 1.0f64;
    let mut v = 1.0f64;
    while v > x {
        v /= 8.0;
        y /= 2.0;
    }
    while 8.0 * v <= x {
        v *= 8.0;
        y *= 2.0;
    }
    for _ in 0..3 {
        y += (x - y.powi(3)) / (3.0 * y * y);
    }
    y
}

/// Per-path CUBIC+Reno state.
pub struct CongestionState {
    pub alg_state: AlgState,
    pub cwin: u64,
    pub ssthresh: u64,
    pub w_max: f64,
    pub w_last_max: f64,
    pub w_reno: f64,
    pub k: f64,
    pub start_of_epoch: u64,
    pub previous_start_of_epoch: u64,
    pub recovery_sequence: u64,
    pub hystart: HyStart,
}

impl CongestionState {
    pub fn new() -> Self {
        Self {
            alg_state: AlgState::SlowStart,
            cwin: CWIN_INITIAL,
            ssthresh: SSTHRESH_INFINITE,
            w_max: 0.0,
            w_last_max: 0.0,
            w_reno: CWIN_INITIAL as f64,
            k: 0.0,
            start_of_epoch: 0,
            previous_start_of_epoch: 0,
            recovery_sequence: 0,
            hystart: HyStart::new(),
        }
    }

    fn w_cubic(&self, now: u64) -> f64 {
        let t = (now.saturating_sub(self.start_of_epoch)) as f64 / 1_000_000.0;
        CUBIC_C * (t - self.k).powi(3) + self.w_max
    }

    fn enter_avoidance(&mut self, now: u64) {
        self.k = cube_root(self.w_max * (1.0 - CUBIC_BETA) / CUBIC_C);
        self.start_of_epoch = now;
        self.previous_start_of_epoch = self.start_of_epoch;
        self.alg_state = AlgState::CongestionAvoidance;
    }

    fn enter_recovery(&mut self, now: u64, send_sequence: u64, signal: LossSignal) {
        self.recovery_sequence = send_sequence;
        self.w_max = self.cwin as f64 / MTU as f64;
        if self.w_max < self.w_last_max {
            self.w_last_max = self.w_max;
            self.w_max *= CUBIC_BETA;
        } else {
            self.w_last_max = self.w_max;
        }
        self.ssthresh = (self.w_max * CUBIC_BETA * MTU as f64) as u64;

        if self.ssthresh < CWIN_MINIMUM {
            // `DESIGN.md` Open Question 2: the sentinel overwrite is the
            // observable outcome, not the intermediate CWIN_MINIMUM write.
            self.cwin = CWIN_MINIMUM;
            self.w_reno = CWIN_MINIMUM as f64;
            self.ssthresh = SSTHRESH_INFINITE;
            self.alg_state = AlgState::SlowStart;
        } else if signal == LossSignal::Timeout {
            self.cwin = CWIN_MINIMUM;
            self.alg_state = AlgState::SlowStart;
        } else {
            self.enter_avoidance(now);
            let win_cubic = (self.w_cubic(now) * MTU as f64) as u64;
            self.cwin = win_cubic.max(self.cwin / 2);
            self.w_reno = self.cwin as f64 / 2.0;
        }
    }

    fn correct_spurious(&mut self, now: u64) {
        self.w_max = self.w_last_max;
        self.enter_avoidance(self.previous_start_of_epoch);
        let win_cubic = self.w_cubic(now) * MTU as f64;
        self.w_reno = win_cubic;
        self.ssthresh = (self.w_max * CUBIC_BETA * MTU as f64) as u64;
        self.cwin = self.w_reno as u64;
    }

    /// Whether a loss-type notification arrives within the Recovery guard
    /// window (measured by both the elapsed-RTT and packet-number tests).
    fn within_recovery_guard(&self, now: u64, smoothed_rtt: u64, highest_ack: u64) -> bool {
        now.saturating_sub(self.start_of_epoch) <= smoothed_rtt && self.recovery_sequence > highest_ack
    }

    pub fn on_ack(&mut self, now: u64, bytes: u64, smoothed_rtt: u64, highest_ack: u64) {
        match self.alg_state {
            AlgState::SlowStart => {
                if smoothed_rtt <= TARGET_RENO_RTT_US {
                    self.cwin += bytes;
                } else {
                    self.cwin += bytes.saturating_mul(smoothed_rtt) / TARGET_RENO_RTT_US.max(1);
                }
                if self.cwin >= self.ssthresh {
                    self.w_reno = self.cwin as f64 / 2.0;
                    self.w_max = self.cwin as f64 / MTU as f64;
                    self.w_last_max = self.w_max;
                    self.enter_avoidance(now);
                }
            }
            AlgState::Recovery => {
                if self.within_recovery_guard(now, smoothed_rtt, highest_ack) {
                    return;
                }
                self.alg_state = AlgState::SlowStart;
                self.cwin += bytes;
                if self.cwin >= self.ssthresh {
                    self.alg_state = AlgState::CongestionAvoidance;
                }
            }
            AlgState::CongestionAvoidance => {
                let win_cubic = self.w_cubic(now) * MTU as f64;
                self.w_reno += (bytes as f64) * MTU as f64 / self.w_reno.max(1.0);
                self.cwin = win_cubic.max(self.w_reno) as u64;
            }
        }
    }

    pub fn on_loss(&mut self, now: u64, signal: LossSignal, smoothed_rtt: u64, highest_ack: u64, send_sequence: u64) {
        match self.alg_state {
            AlgState::SlowStart => {
                if now.saturating_sub(self.start_of_epoch) > smoothed_rtt || self.recovery_sequence <= highest_ack {
                    self.enter_recovery(now, send_sequence, signal);
                }
            }
            AlgState::Recovery => {
                if self.within_recovery_guard(now, smoothed_rtt, highest_ack) {
                    return;
                }
                self.enter_recovery(now, send_sequence, signal);
            }
            AlgState::CongestionAvoidance => {
                self.enter_recovery(now, send_sequence, signal);
            }
        }
    }

    pub fn on_spurious_repeat(&mut self, now: u64) {
        self.correct_spurious(now);
    }

    /// `rtt_measurement`: only meaningful in SlowStart, where a HyStart
    /// trip commits an early exit to CongestionAvoidance.
    pub fn on_rtt_measurement(&mut self, now: u64, rtt_us: u64) {
        if !matches!(self.alg_state, AlgState::SlowStart) || self.ssthresh != SSTHRESH_INFINITE {
            self.hystart.on_sample(now, rtt_us);
            return;
        }
        if self.hystart.on_sample(now, rtt_us) {
            self.ssthresh = self.cwin;
            self.w_max = self.cwin as f64 / MTU as f64;
            self.w_last_max = self.w_max;
            self.w_reno = self.cwin as f64;
            self.enter_avoidance(now);
            // Clamp so we're immediately past the post-K region.
            let k_us = (self.k * 1_000_000.0) as u64;
            if now.saturating_sub(self.start_of_epoch) < k_us {
                self.start_of_epoch = now.saturating_sub(k_us);
                self.previous_start_of_epoch = self.start_of_epoch;
            }
        }
    }

    pub fn cwin(&self) -> u64 {
        self.cwin
    }

    pub fn state(&self) -> AlgState {
        self.alg_state
    }

    pub fn ssthresh(&self) -> u64 {
        self.ssthresh
    }
}

impl Default for CongestionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_root_matches_known_value() {
        let r = cube_root(27.0);
        assert!((r - 3.0).abs() < 1e-6);
        let r = cube_root(8.0);
        assert!((r - 2.0).abs() < 1e-6);
    }

    #[test]
    fn slow_start_exits_to_avoidance_at_ssthresh() {
        // Scenario E.
        let mut cc = CongestionState::new();
        cc.ssthresh = cc.cwin + 1;
        let pre_cwin = cc.cwin;
        cc.on_ack(0, 2 * MTU, 50_000, 0);
        assert_eq!(cc.alg_state, AlgState::CongestionAvoidance);
        let expected_k = cube_root((pre_cwin as f64 / MTU as f64) * (1.0 - CUBIC_BETA) / CUBIC_C);
        assert!((cc.k - expected_k).abs() < 1e-6);
    }

    #[test]
    fn congestion_avoidance_never_drops_below_reno_floor() {
        let mut cc = CongestionState::new();
        cc.alg_state = AlgState::CongestionAvoidance;
        cc.w_reno = 20_000.0;
        cc.w_max = 30.0;
        cc.start_of_epoch = 0;
        cc.k = 1.0;
        for t in (0..10).map(|i| i * 10_000) {
            cc.on_ack(t, MTU, 50_000, 0);
            assert!(cc.cwin as f64 >= cc.w_reno);
        }
    }

    #[test]
    fn enter_recovery_non_timeout_above_minimum_lands_in_avoidance() {
        let mut cc = CongestionState::new();
        cc.cwin = 10 * CWIN_MINIMUM;
        cc.w_last_max = 0.0;
        cc.on_loss(0, LossSignal::Repeat, 50_000, 0, 1);
        assert!(cc.ssthresh >= CWIN_MINIMUM);
        assert_eq!(cc.alg_state, AlgState::CongestionAvoidance);
    }

    #[test]
    fn spurious_repeat_restores_w_max_from_w_last_max() {
        // Scenario F.
        let mut cc = CongestionState::new();
        cc.cwin = 10 * CWIN_MINIMUM;
        cc.on_loss(0, LossSignal::Repeat, 50_000, 0, 1);
        let w_last_max = cc.w_last_max;
        cc.recovery_sequence = 1;
        cc.on_spurious_repeat(25_000);
        assert_eq!(cc.w_max, w_last_max);
        assert_eq!(cc.alg_state, AlgState::CongestionAvoidance);
    }

    #[test]
    fn recovery_guard_ignores_everything_but_spurious_repeat() {
        let mut cc = CongestionState::new();
        cc.alg_state = AlgState::Recovery;
        cc.start_of_epoch = 0;
        cc.recovery_sequence = 100;
        let cwin_before = cc.cwin;
        cc.on_ack(10, MTU, 1_000_000, 50); // within guard: highest_ack(50) < recovery_sequence(100)
        assert_eq!(cc.cwin, cwin_before);
    }

    #[test]
    fn hystart_trips_on_scope_th_consecutive_excess_sample() {
        let mut hy = HyStart::new();
        let mut tripped = false;
        let mut now = 0u64;
        // Establish a low filtered minimum first.
        tripped |= hy.on_sample(now, 10_000);
        for _ in 0..MIN_MAX_RTT_SCOPE {
            now += 2_000;
            // Each sample is >= 1.25x the filtered min of 10ms.
            tripped |= hy.on_sample(now, 13_000);
        }
        assert!(tripped);
    }
}
