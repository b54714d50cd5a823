//! Per-episode reward shaping from raw compiler metrics.
//!
//! When the compiler reports an explicit reward it is used as-is. Otherwise the compiler can
//! report the unit's object size and the machine code analyzer throughput after each pass, and
//! the shaper turns the improvement relative to the previous step into a weighted reward.

use serde::{Deserialize, Serialize};

use crate::config::RewardConfig;

/// Raw measurements of one compilation unit after the most recent pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitMetrics {
    /// Object size in bytes.
    pub size: f64,
    /// Estimated cycles (lower is better).
    pub throughput: f64,
}

#[derive(Debug, Clone)]
pub struct RewardShaper {
    cfg: RewardConfig,
    base: Option<UnitMetrics>,
    prev: Option<UnitMetrics>,
}

impl RewardShaper {
    pub fn new(cfg: RewardConfig) -> Self {
        Self {
            cfg,
            base: None,
            prev: None,
        }
    }

    /// Forget everything and start a new episode from `initial`.
    pub fn reset(&mut self, initial: Option<UnitMetrics>) {
        self.base = initial;
        self.prev = initial;
    }

    /// Reward for one step.
    ///
    /// `explicit` wins over `metrics`. Metrics seen without a baseline become the baseline and
    /// score zero.
    pub fn reward(&mut self, explicit: Option<f32>, metrics: Option<UnitMetrics>) -> f32 {
        if let Some(r) = explicit {
            if let Some(m) = metrics {
                self.observe(m);
            }
            return r;
        }
        let Some(cur) = metrics else {
            return 0.0;
        };
        let (Some(base), Some(prev)) = (self.base, self.prev) else {
            self.observe(cur);
            return 0.0;
        };

        let size_term = thresholded(
            relative_gain(prev.size, cur.size, base.size),
            self.cfg.size_reward_thresh,
        );
        let mca_term = thresholded(
            relative_gain(prev.throughput, cur.throughput, base.throughput),
            self.cfg.mca_reward_thresh,
        );
        self.prev = Some(cur);
        (self.cfg.alpha * size_term + self.cfg.beta * mca_term) as f32
    }

    fn observe(&mut self, m: UnitMetrics) {
        if self.base.is_none() {
            self.base = Some(m);
        }
        self.prev = Some(m);
    }
}

fn relative_gain(prev: f64, cur: f64, base: f64) -> f64 {
    if base <= 0.0 || !base.is_finite() {
        return 0.0;
    }
    let g = (prev - cur) / base;
    if g.is_finite() {
        g
    } else {
        0.0
    }
}

fn thresholded(v: f64, thresh: f64) -> f64 {
    if v.abs() < thresh {
        0.0
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(size: f64, throughput: f64) -> UnitMetrics {
        UnitMetrics { size, throughput }
    }

    fn cfg() -> RewardConfig {
        RewardConfig {
            alpha: 10.0,
            beta: 5.0,
            size_reward_thresh: 0.2,
            mca_reward_thresh: 0.2,
        }
    }

    #[test]
    fn explicit_reward_wins() {
        let mut s = RewardShaper::new(cfg());
        s.reset(Some(m(100.0, 100.0)));
        assert_eq!(s.reward(Some(1.5), Some(m(10.0, 10.0))), 1.5);
    }

    #[test]
    fn missing_everything_scores_zero() {
        let mut s = RewardShaper::new(cfg());
        s.reset(None);
        assert_eq!(s.reward(None, None), 0.0);
    }

    #[test]
    fn shrinking_code_is_rewarded_relative_to_baseline() {
        let mut s = RewardShaper::new(cfg());
        s.reset(Some(m(1000.0, 400.0)));
        // size -50%, throughput -25% of baseline
        let r = s.reward(None, Some(m(500.0, 300.0)));
        let expected = 10.0 * 0.5 + 5.0 * 0.25;
        assert!((r as f64 - expected).abs() < 1e-6, "r={r}");
    }

    #[test]
    fn small_changes_fall_under_threshold() {
        let mut s = RewardShaper::new(cfg());
        s.reset(Some(m(1000.0, 1000.0)));
        assert_eq!(s.reward(None, Some(m(950.0, 990.0))), 0.0);
    }

    #[test]
    fn regressions_are_penalized_against_previous_step() {
        let mut s = RewardShaper::new(cfg());
        s.reset(Some(m(100.0, 100.0)));
        let _ = s.reward(None, Some(m(50.0, 100.0)));
        // 50 -> 100 is a regression of 50% of the baseline.
        let r = s.reward(None, Some(m(100.0, 100.0)));
        assert!((r as f64 + 5.0).abs() < 1e-6, "r={r}");
    }

    #[test]
    fn first_metrics_without_baseline_become_baseline() {
        let mut s = RewardShaper::new(cfg());
        s.reset(None);
        assert_eq!(s.reward(None, Some(m(100.0, 100.0))), 0.0);
        let r = s.reward(None, Some(m(50.0, 100.0)));
        assert!((r - 5.0).abs() < 1e-6);
    }
}
