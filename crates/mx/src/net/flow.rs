//! Two-state send rate control.
//!
//! The client sends fast while the average round trip stays under the threshold
//! and drops to the slow rate as soon as it does not. Returning to the fast rate
//! requires the round trip to stay good for the current penalty time. Falling
//! back again shortly after recovering doubles the penalty; long stretches of
//! good conditions halve it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub rtt_threshold_ms: f64,
    pub good_send_rate: f64,
    pub bad_send_rate: f64,
    pub initial_penalty_secs: f64,
    pub min_penalty_secs: f64,
    pub max_penalty_secs: f64,
    /// A relapse within this long of recovering doubles the penalty.
    pub relapse_window_secs: f64,
    /// Good conditions held this long halve the penalty.
    pub penalty_reduction_secs: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            rtt_threshold_ms: 250.0,
            good_send_rate: 20.0,
            bad_send_rate: 10.0,
            initial_penalty_secs: 4.0,
            min_penalty_secs: 1.0,
            max_penalty_secs: 60.0,
            relapse_window_secs: 10.0,
            penalty_reduction_secs: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    Good,
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowChange {
    pub mode: FlowMode,
    pub penalty: Duration,
}

#[derive(Debug, Clone)]
pub struct FlowControl {
    config: FlowConfig,
    mode: FlowMode,
    penalty_time: f64,
    good_conditions_time: f64,
    penalty_reduction_accumulator: f64,
}

impl FlowControl {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            penalty_time: config.initial_penalty_secs,
            config,
            mode: FlowMode::Good,
            good_conditions_time: 0.0,
            penalty_reduction_accumulator: 0.0,
        }
    }

    pub fn mode(&self) -> FlowMode {
        self.mode
    }

    pub fn is_good_mode(&self) -> bool {
        self.mode == FlowMode::Good
    }

    pub fn penalty(&self) -> Duration {
        Duration::from_secs_f64(self.penalty_time)
    }

    pub fn penalty_secs(&self) -> f64 {
        self.penalty_time
    }

    pub fn good_conditions_secs(&self) -> f64 {
        self.good_conditions_time
    }

    /// Datagrams per second allowed in the current mode.
    pub fn send_rate(&self) -> f64 {
        match self.mode {
            FlowMode::Good => self.config.good_send_rate,
            FlowMode::Bad => self.config.bad_send_rate,
        }
    }

    pub fn send_interval(&self) -> f64 {
        1.0 / self.send_rate()
    }

    pub fn update(&mut self, delta_secs: f64, rtt_ms: f64) -> Option<FlowChange> {
        match self.mode {
            FlowMode::Good => self.update_good(delta_secs, rtt_ms),
            FlowMode::Bad => self.update_bad(delta_secs, rtt_ms),
        }
    }

    fn update_good(&mut self, delta_secs: f64, rtt_ms: f64) -> Option<FlowChange> {
        if rtt_ms > self.config.rtt_threshold_ms {
            self.mode = FlowMode::Bad;
            if self.good_conditions_time < self.config.relapse_window_secs {
                self.penalty_time = (self.penalty_time * 2.0).min(self.config.max_penalty_secs);
            }
            self.good_conditions_time = 0.0;
            return Some(self.change());
        }

        self.good_conditions_time += delta_secs;
        self.penalty_reduction_accumulator += delta_secs;

        if self.penalty_reduction_accumulator > self.config.penalty_reduction_secs {
            self.penalty_time = (self.penalty_time / 2.0).max(self.config.min_penalty_secs);
            self.penalty_reduction_accumulator = 0.0;
            return Some(self.change());
        }

        None
    }

    fn update_bad(&mut self, delta_secs: f64, rtt_ms: f64) -> Option<FlowChange> {
        if rtt_ms < self.config.rtt_threshold_ms {
            self.good_conditions_time += delta_secs;
        } else {
            self.good_conditions_time = 0.0;
        }

        if self.good_conditions_time > self.penalty_time {
            self.mode = FlowMode::Good;
            self.good_conditions_time = 0.0;
            self.penalty_reduction_accumulator = 0.0;
            return Some(self.change());
        }

        None
    }

    fn change(&self) -> FlowChange {
        FlowChange {
            mode: self.mode,
            penalty: self.penalty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: f64 = 0.5;

    fn run(flow: &mut FlowControl, secs: f64, rtt_ms: f64) -> Vec<FlowChange> {
        let ticks = (secs / TICK).round() as usize;
        (0..ticks).filter_map(|_| flow.update(TICK, rtt_ms)).collect()
    }

    #[test]
    fn test_starts_good_at_fast_rate() {
        let flow = FlowControl::new(FlowConfig::default());
        assert!(flow.is_good_mode());
        assert_eq!(flow.send_rate(), 20.0);
        assert_eq!(flow.penalty_secs(), 4.0);
    }

    #[test]
    fn test_single_spike_drops_then_recovers_after_penalty() {
        let mut flow = FlowControl::new(FlowConfig::default());

        let change = flow.update(TICK, 400.0).expect("spike must drop to bad");
        assert_eq!(change.mode, FlowMode::Bad);
        // Dropped within the relapse window of start, so the penalty doubled.
        assert_eq!(flow.penalty_secs(), 8.0);
        assert_eq!(flow.send_rate(), 10.0);

        // 8 seconds of good conditions is not yet more than the penalty.
        assert!(run(&mut flow, 8.0, 50.0).is_empty());
        assert_eq!(flow.mode(), FlowMode::Bad);

        let changes = run(&mut flow, TICK, 50.0);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].mode, FlowMode::Good);
    }

    #[test]
    fn test_bad_rtt_resets_recovery_progress() {
        let mut flow = FlowControl::new(FlowConfig::default());
        flow.update(TICK, 400.0);

        run(&mut flow, 6.0, 50.0);
        flow.update(TICK, 300.0);
        assert_eq!(flow.good_conditions_secs(), 0.0);

        assert!(run(&mut flow, 8.0, 50.0).is_empty());
        assert_eq!(flow.mode(), FlowMode::Bad);
    }

    #[test]
    fn test_repeated_relapse_caps_penalty() {
        let mut flow = FlowControl::new(FlowConfig::default());

        for _ in 0..10 {
            flow.update(TICK, 400.0);
            let penalty = flow.penalty_secs();
            run(&mut flow, penalty + TICK, 50.0);
            assert!(flow.is_good_mode());
        }

        assert_eq!(flow.penalty_secs(), 60.0);
    }

    #[test]
    fn test_sustained_good_conditions_halve_penalty_to_floor() {
        let mut flow = FlowControl::new(FlowConfig::default());

        let changes = run(&mut flow, 10.5, 50.0);
        assert_eq!(changes.len(), 1);
        assert_eq!(flow.penalty_secs(), 2.0);

        run(&mut flow, 10.5, 50.0);
        assert_eq!(flow.penalty_secs(), 1.0);

        run(&mut flow, 10.5, 50.0);
        assert_eq!(flow.penalty_secs(), 1.0);
    }

    #[test]
    fn test_late_relapse_keeps_penalty() {
        let mut flow = FlowControl::new(FlowConfig::default());

        run(&mut flow, 10.5, 50.0);
        assert_eq!(flow.penalty_secs(), 2.0);

        flow.update(TICK, 400.0);
        assert_eq!(flow.mode(), FlowMode::Bad);
        assert_eq!(flow.penalty_secs(), 2.0);
    }
}
