//! Per-epoch schedules for the learning rate and momentum.
//!
//! The epoch range is split into one contiguous segment per initial value.
//! Each segment starts from its own initial value and evolves according to
//! the [`UpdateRule`].

use serde::{Deserialize, Serialize};

use crate::core::{DbnError, DbnResult};

/// How a scheduled parameter evolves across the epochs of a segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "lowercase")]
pub enum UpdateRule {
    /// Always the segment's initial value.
    #[default]
    Constant,
    /// Linear interpolation from the initial value to `end` at the segment's last epoch.
    Linear { end: f32 },
    /// `initial * decay^i` for the i-th epoch of the segment.
    Exponential { decay: f32 },
}

impl UpdateRule {
    /// Build a rule from its name. `end` and `decay` are only read by the rule that uses them.
    ///
    /// # Errors
    /// - `InvalidConfig` for an unknown rule name
    pub fn from_name(name: &str, end: f32, decay: f32) -> DbnResult<Self> {
        match name {
            "constant" => Ok(UpdateRule::Constant),
            "linear" => Ok(UpdateRule::Linear { end }),
            "exponential" => Ok(UpdateRule::Exponential { decay }),
            _ => Err(DbnError::InvalidConfig(format!(
                "unknown update rule '{name}' (expected constant, linear or exponential)"
            ))),
        }
    }

    fn value(&self, initial: f32, index: usize, len: usize) -> f32 {
        match *self {
            UpdateRule::Constant => initial,
            UpdateRule::Linear { end } => {
                if len <= 1 {
                    initial
                } else {
                    let t = index as f32 / (len - 1) as f32;
                    initial + (end - initial) * t
                }
            }
            UpdateRule::Exponential { decay } => initial * decay.powi(index as i32),
        }
    }
}

/// Produces one parameter value per epoch, in epoch order.
#[derive(Debug, Clone)]
pub struct ParameterSchedule {
    rule: UpdateRule,
    /// (initial value, segment length) for each segment
    segments: Vec<(f32, usize)>,
    epochs: usize,
    cursor: usize,
}

impl ParameterSchedule {
    /// Create a schedule spanning `epochs` epochs.
    ///
    /// # Errors
    /// - `InvalidConfig` if `initial` is empty, `epochs` is zero, or there are
    ///   more segments than epochs
    pub fn new(rule: UpdateRule, initial: &[f32], epochs: usize) -> DbnResult<Self> {
        if initial.is_empty() {
            return Err(DbnError::InvalidConfig(
                "schedule needs at least one initial value".to_string(),
            ));
        }
        if epochs == 0 {
            return Err(DbnError::InvalidConfig("schedule needs at least one epoch".to_string()));
        }
        if initial.len() > epochs {
            return Err(DbnError::InvalidConfig(format!(
                "{} schedule segments do not fit in {epochs} epochs",
                initial.len()
            )));
        }

        let base = epochs / initial.len();
        let extra = epochs % initial.len();
        let segments = initial
            .iter()
            .enumerate()
            .map(|(s, &v)| (v, base + usize::from(s < extra)))
            .collect();

        Ok(Self {
            rule,
            segments,
            epochs,
            cursor: 0,
        })
    }

    /// Return the value for the next epoch and advance.
    ///
    /// Calls beyond the scheduled epoch count keep returning the final value.
    pub fn update(&mut self) -> f32 {
        let epoch = self.cursor.min(self.epochs - 1);
        self.cursor += 1;

        let mut start = 0;
        for &(initial, len) in &self.segments {
            if epoch < start + len {
                return self.rule.value(initial, epoch - start, len);
            }
            start += len;
        }
        // segment lengths sum to `epochs`, so the loop always returns
        let (initial, len) = self.segments[self.segments.len() - 1];
        self.rule.value(initial, len - 1, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_constant_schedule() {
        let mut schedule = ParameterSchedule::new(UpdateRule::Constant, &[0.01], 10).unwrap();
        for _ in 0..10 {
            assert_eq!(schedule.update(), 0.01);
        }
        // past the last epoch the value holds
        assert_eq!(schedule.update(), 0.01);
    }

    #[test]
    fn test_linear_schedule_strictly_monotonic() {
        let rule = UpdateRule::Linear { end: 0.001 };
        let mut schedule = ParameterSchedule::new(rule, &[0.1], 10).unwrap();
        let values: Vec<f32> = (0..10).map(|_| schedule.update()).collect();
        assert_abs_diff_eq!(values[0], 0.1);
        assert_abs_diff_eq!(values[9], 0.001, epsilon = 1e-7);
        for pair in values.windows(2) {
            assert!(pair[1] < pair[0], "{values:?}");
        }
    }

    #[test]
    fn test_exponential_schedule() {
        let rule = UpdateRule::Exponential { decay: 0.5 };
        let mut schedule = ParameterSchedule::new(rule, &[1.0], 4).unwrap();
        let values: Vec<f32> = (0..4).map(|_| schedule.update()).collect();
        assert_eq!(values, vec![1.0, 0.5, 0.25, 0.125]);
    }

    #[test]
    fn test_segments() {
        let mut schedule = ParameterSchedule::new(UpdateRule::Constant, &[0.5, 0.9], 5).unwrap();
        let values: Vec<f32> = (0..5).map(|_| schedule.update()).collect();
        assert_eq!(values, vec![0.5, 0.5, 0.5, 0.9, 0.9]);
    }

    #[test]
    fn test_update_saturates() {
        let rule = UpdateRule::Linear { end: 0.0 };
        let mut schedule = ParameterSchedule::new(rule, &[1.0], 2).unwrap();
        schedule.update();
        assert_eq!(schedule.update(), 0.0);
        assert_eq!(schedule.update(), 0.0);
    }

    #[test]
    fn test_invalid_schedules() {
        assert!(ParameterSchedule::new(UpdateRule::Constant, &[], 3).is_err());
        assert!(ParameterSchedule::new(UpdateRule::Constant, &[0.1], 0).is_err());
        assert!(ParameterSchedule::new(UpdateRule::Constant, &[0.1, 0.2, 0.3], 2).is_err());
    }

    #[test]
    fn test_rule_from_name() {
        assert_eq!(UpdateRule::from_name("constant", 0.0, 0.0).unwrap(), UpdateRule::Constant);
        assert_eq!(
            UpdateRule::from_name("exponential", 0.0, 0.9).unwrap(),
            UpdateRule::Exponential { decay: 0.9 }
        );
        assert!(UpdateRule::from_name("cosine", 0.0, 0.0).is_err());
    }

    #[test]
    fn test_rule_serde() {
        let rule: UpdateRule = serde_json::from_str(r#"{"rule":"linear","end":0.5}"#).unwrap();
        assert_eq!(rule, UpdateRule::Linear { end: 0.5 });
    }
}
