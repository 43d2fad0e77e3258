//! Evaluation report written by the external evaluator.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FormdexError, Result};

/// Metrics for one trained checkpoint.
///
/// Every field is required. `meets_target` is computed by the evaluator and
/// trusted as-is; [`EvalReport::is_consistent`] only exists for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalReport {
    /// Primary metric, mAP@0.5.
    #[serde(alias = "mAP50", alias = "map_50")]
    pub map50: f64,

    /// Secondary metric, mAP@0.5:0.95.
    #[serde(alias = "mAP50-95", alias = "map50-95")]
    pub map50_95: f64,

    pub precision: f64,

    pub recall: f64,

    /// Threshold the evaluator compared against.
    pub target_map: f64,

    pub meets_target: bool,
}

impl EvalReport {
    /// Build a report whose flag is derived from the metric.
    pub fn new(map50: f64, map50_95: f64, precision: f64, recall: f64, target_map: f64) -> Self {
        Self {
            map50,
            map50_95,
            precision,
            recall,
            target_map,
            meets_target: map50 >= target_map,
        }
    }

    /// Read and validate a report file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let report: EvalReport =
            serde_json::from_str(&content).map_err(|e| FormdexError::InvalidEvalReport {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        report
            .validate()
            .map_err(|reason| FormdexError::InvalidEvalReport {
                path: path.to_path_buf(),
                reason,
            })?;
        Ok(report)
    }

    /// All metrics must lie in [0, 1].
    pub fn validate(&self) -> std::result::Result<(), String> {
        let fields = [
            ("map50", self.map50),
            ("map50_95", self.map50_95),
            ("precision", self.precision),
            ("recall", self.recall),
            ("target_map", self.target_map),
        ];
        for (name, value) in fields {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{} = {} is outside [0, 1]", name, value));
            }
        }
        Ok(())
    }

    /// Whether `meets_target` agrees with `map50 >= target_map`.
    pub fn is_consistent(&self) -> bool {
        self.meets_target == (self.map50 >= self.target_map)
    }
}
