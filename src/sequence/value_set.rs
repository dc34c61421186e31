//! Per-axis motion program.
//!
//! Text forms (used by configuration files and the CLI):
//!
//! | Form          | Meaning                                   |
//! |---------------|-------------------------------------------|
//! | `5`           | fixed position                            |
//! | `0:2:10`      | stepped range, `start:step:end`           |
//! | `0-100@25`    | continuous sweep, `start-end@speed`       |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Tolerance added before flooring the step count so that ranges such as
/// `0:0.1:1` are not cut short by floating-point error.
const STEP_EPSILON: f64 = 1e-9;

/// Upper bound on the positions of one stepped range.
pub const MAX_STEPS: i64 = 1_000_000;

/// Errors building or parsing an [`AxisValueSet`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueSetError {
    /// Text did not match any of the accepted forms
    #[error("cannot parse axis values '{0}' (expected 'v', 'start:step:end' or 'start-end@speed')")]
    Parse(String),

    /// A non-degenerate stepped range needs a non-zero step
    #[error("step must be non-zero for range {start}..{end}")]
    ZeroStep {
        /// Range start
        start: f64,
        /// Range end
        end: f64,
    },

    /// Sweep speed must be strictly positive
    #[error("sweep speed must be positive, got {0}")]
    NonPositiveSpeed(f64),

    /// The range holds more positions than [`MAX_STEPS`]
    #[error("range {start}..{end} with step {step} exceeds {max} positions", max = MAX_STEPS)]
    TooManySteps {
        /// Range start
        start: f64,
        /// Step size
        step: f64,
        /// Range end
        end: f64,
    },

    /// NaN or infinite input
    #[error("axis values must be finite")]
    NotFinite,
}

/// One axis's motion program for one row.
///
/// `step_or_speed` is the step size for stepped sets and the sweep velocity
/// for continuous sets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AxisValueSet {
    start: f64,
    end: f64,
    step_or_speed: f64,
    continuous: bool,
}

impl AxisValueSet {
    /// A single fixed position.
    pub fn fixed(value: f64) -> Self {
        Self {
            start: value,
            end: value,
            step_or_speed: 0.0,
            continuous: false,
        }
    }

    /// A stepped range from `start` to `end`.
    ///
    /// The sign of `step` is ignored: stepping always runs from `start`
    /// towards `end`.
    pub fn stepped(start: f64, step: f64, end: f64) -> Result<Self, ValueSetError> {
        if !(start.is_finite() && step.is_finite() && end.is_finite()) {
            return Err(ValueSetError::NotFinite);
        }
        if step == 0.0 && start != end {
            return Err(ValueSetError::ZeroStep { start, end });
        }
        if step != 0.0 && (end - start).abs() / step.abs() >= MAX_STEPS as f64 {
            return Err(ValueSetError::TooManySteps { start, step, end });
        }
        Ok(Self {
            start,
            end,
            step_or_speed: step.abs(),
            continuous: false,
        })
    }

    /// A continuously swept range driven at `speed` units per second.
    pub fn continuous(start: f64, end: f64, speed: f64) -> Result<Self, ValueSetError> {
        if !(start.is_finite() && end.is_finite() && speed.is_finite()) {
            return Err(ValueSetError::NotFinite);
        }
        if speed <= 0.0 {
            return Err(ValueSetError::NonPositiveSpeed(speed));
        }
        Ok(Self {
            start,
            end,
            step_or_speed: speed,
            continuous: true,
        })
    }

    /// First position
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Last position
    pub fn end(&self) -> f64 {
        self.end
    }

    /// Step size or sweep speed
    pub fn step_or_speed(&self) -> f64 {
        self.step_or_speed
    }

    /// Step size, for stepped sets
    pub fn step(&self) -> Option<f64> {
        (!self.continuous).then_some(self.step_or_speed)
    }

    /// Sweep speed, for continuous sets
    pub fn speed(&self) -> Option<f64> {
        self.continuous.then_some(self.step_or_speed)
    }

    /// Whether this axis is driven by a velocity-controlled move to `end`
    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    /// Whether the axis holds a single position
    pub fn is_fixed(&self) -> bool {
        !self.continuous && self.start == self.end
    }

    /// Signed direction of travel (`1.0` or `-1.0`)
    pub fn direction(&self) -> f64 {
        if self.end < self.start {
            -1.0
        } else {
            1.0
        }
    }

    /// Number of discrete positions; `-1` for continuous sets.
    pub fn steps(&self) -> i64 {
        if self.continuous {
            return -1;
        }
        if self.step_or_speed == 0.0 {
            return 1;
        }
        let span = (self.end - self.start).abs();
        let count = (span / self.step_or_speed + STEP_EPSILON).floor() as i64 + 1;
        count.max(1)
    }

    /// The positions visited, from `start` towards `end`.
    ///
    /// For a continuous set these are the two sweep endpoints.
    pub fn values(&self) -> Vec<f64> {
        if self.continuous {
            return vec![self.start, self.end];
        }
        let step = self.direction() * self.step_or_speed;
        (0..self.steps())
            .map(|i| self.start + step * i as f64)
            .collect()
    }

    /// Position of step `index`
    pub fn value_at(&self, index: usize) -> f64 {
        self.start + self.direction() * self.step_or_speed * index as f64
    }

    /// Shift the whole program by `delta`
    pub fn translate(&mut self, delta: f64) {
        self.start += delta;
        self.end += delta;
    }
}

fn parse_number(text: &str, original: &str) -> Result<f64, ValueSetError> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| ValueSetError::Parse(original.to_string()))
}

/// Index of the `-` separating start and end in `start-end`, skipping a
/// leading sign and exponent signs.
fn range_separator(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    (1..bytes.len()).find(|&i| {
        bytes[i] == b'-' && (bytes[i - 1].is_ascii_digit() || bytes[i - 1] == b'.')
    })
}

impl FromStr for AxisValueSet {
    type Err = ValueSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() {
            return Err(ValueSetError::Parse(s.to_string()));
        }

        if let Some((range, speed)) = text.split_once('@') {
            let range = range.trim();
            let split = range_separator(range).ok_or_else(|| ValueSetError::Parse(s.to_string()))?;
            let start = parse_number(&range[..split], s)?;
            let end = parse_number(&range[split + 1..], s)?;
            let speed = parse_number(speed, s)?;
            return Self::continuous(start, end, speed);
        }

        let parts: Vec<&str> = text.split(':').collect();
        match parts.as_slice() {
            [value] => {
                let value = parse_number(value, s)?;
                if !value.is_finite() {
                    return Err(ValueSetError::NotFinite);
                }
                Ok(Self::fixed(value))
            }
            [start, step, end] => Self::stepped(
                parse_number(start, s)?,
                parse_number(step, s)?,
                parse_number(end, s)?,
            ),
            _ => Err(ValueSetError::Parse(s.to_string())),
        }
    }
}

impl fmt::Display for AxisValueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.continuous {
            write!(f, "{}-{}@{}", self.start, self.end, self.step_or_speed)
        } else if self.step_or_speed == 0.0 {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}:{}", self.start, self.step_or_speed, self.end)
        }
    }
}

impl TryFrom<String> for AxisValueSet {
    type Error = ValueSetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AxisValueSet> for String {
    fn from(value: AxisValueSet) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stepped_range_enumerates_inclusive_end() {
        let set = AxisValueSet::stepped(0.0, 2.0, 10.0).unwrap();
        assert_eq!(set.steps(), 6);
        assert_eq!(set.values(), vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
    }

    #[test]
    fn degenerate_range_has_one_step() {
        let set = AxisValueSet::stepped(10.0, 3.0, 10.0).unwrap();
        assert_eq!(set.steps(), 1);
        assert_eq!(set.values(), vec![10.0]);
    }

    #[test]
    fn partial_last_step_is_dropped() {
        let set = AxisValueSet::stepped(0.0, 3.0, 10.0).unwrap();
        assert_eq!(set.values(), vec![0.0, 3.0, 6.0, 9.0]);
    }

    #[test]
    fn fractional_steps_survive_rounding() {
        let set = AxisValueSet::stepped(0.0, 0.1, 1.0).unwrap();
        assert_eq!(set.steps(), 11);
    }

    #[test]
    fn descending_range_steps_towards_end() {
        let set: AxisValueSet = "10:-2.5:0".parse().unwrap();
        assert_eq!(set.steps(), 5);
        assert_eq!(set.values(), vec![10.0, 7.5, 5.0, 2.5, 0.0]);
    }

    #[test]
    fn step_count_is_bounded() {
        assert!(matches!(
            AxisValueSet::stepped(0.0, 1e-12, 1e6),
            Err(ValueSetError::TooManySteps { .. })
        ));
        assert!(matches!(
            "-1e308:1:1e308".parse::<AxisValueSet>(),
            Err(ValueSetError::TooManySteps { .. })
        ));

        let largest = AxisValueSet::stepped(0.0, 1.0, (MAX_STEPS - 1) as f64).unwrap();
        assert_eq!(largest.steps(), MAX_STEPS);
    }

    #[test]
    fn continuous_set_reports_minus_one_steps() {
        let set = AxisValueSet::continuous(0.0, 100.0, 25.0).unwrap();
        assert_eq!(set.steps(), -1);
        assert_eq!(set.speed(), Some(25.0));
        assert_eq!(set.step(), None);
    }

    #[test]
    fn rejects_zero_step_and_bad_speed() {
        assert_eq!(
            AxisValueSet::stepped(0.0, 0.0, 5.0),
            Err(ValueSetError::ZeroStep { start: 0.0, end: 5.0 })
        );
        assert!(AxisValueSet::stepped(5.0, 0.0, 5.0).is_ok());
        assert_eq!(
            AxisValueSet::continuous(0.0, 5.0, 0.0),
            Err(ValueSetError::NonPositiveSpeed(0.0))
        );
    }

    #[test]
    fn parses_text_forms() {
        assert_eq!("5".parse::<AxisValueSet>().unwrap(), AxisValueSet::fixed(5.0));
        assert_eq!(
            " 0:2:10 ".parse::<AxisValueSet>().unwrap(),
            AxisValueSet::stepped(0.0, 2.0, 10.0).unwrap()
        );
        assert_eq!(
            "0-100@25".parse::<AxisValueSet>().unwrap(),
            AxisValueSet::continuous(0.0, 100.0, 25.0).unwrap()
        );
        assert_eq!(
            "-50--10@5".parse::<AxisValueSet>().unwrap(),
            AxisValueSet::continuous(-50.0, -10.0, 5.0).unwrap()
        );
        assert!("1:2".parse::<AxisValueSet>().is_err());
        assert!("abc".parse::<AxisValueSet>().is_err());
        assert!("".parse::<AxisValueSet>().is_err());
    }

    #[test]
    fn display_matches_parse_form() {
        assert_eq!(AxisValueSet::fixed(-3.5).to_string(), "-3.5");
        assert_eq!(
            AxisValueSet::stepped(0.0, 2.0, 10.0).unwrap().to_string(),
            "0:2:10"
        );
        assert_eq!(
            AxisValueSet::continuous(0.0, 100.0, 25.0).unwrap().to_string(),
            "0-100@25"
        );
    }

    #[test]
    fn serde_uses_text_form() {
        #[derive(Deserialize)]
        struct Holder {
            z: AxisValueSet,
        }

        let holder: Holder = toml::from_str("z = \"0:2:10\"").unwrap();
        assert_eq!(holder.z.steps(), 6);

        let bad: Result<Holder, _> = toml::from_str("z = \"0:0:10\"");
        assert!(bad.is_err());
    }

    #[test]
    fn translate_shifts_both_ends() {
        let mut set = AxisValueSet::stepped(0.0, 2.0, 10.0).unwrap();
        set.translate(1.5);
        assert_eq!(set.start(), 1.5);
        assert_eq!(set.end(), 11.5);
        assert_eq!(set.steps(), 6);
    }
}
