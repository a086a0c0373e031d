use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::aggregate::CompositeScore;
use crate::directory::EmployeeDirectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StressLevel {
    Stressed,
    Normal,
}

impl fmt::Display for StressLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stressed => f.write_str("Stressed"),
            Self::Normal => f.write_str("Normal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub individual_id: String,
    pub level: StressLevel,
    pub composite: f64,
    pub timestamp: DateTime<Utc>,
}

/// Turns a composite score into a verdict with a strict `>` threshold.
#[derive(Debug, Clone, Copy)]
pub struct DecisionEngine {
    threshold: f64,
}

impl DecisionEngine {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn level(&self, composite: f64) -> StressLevel {
        if composite > self.threshold {
            StressLevel::Stressed
        } else {
            StressLevel::Normal
        }
    }

    pub fn decide(&self, score: &CompositeScore) -> Verdict {
        Verdict {
            individual_id: score.individual_id.clone(),
            level: self.level(score.value),
            composite: score.value,
            timestamp: Utc::now(),
        }
    }

    /// Persist `verdict`; the only side effect a run has outside itself.
    pub fn commit(&self, verdict: &Verdict, directory: &dyn EmployeeDirectory) -> anyhow::Result<()> {
        directory.update_stress_level(&verdict.individual_id, verdict.level, verdict.timestamp)?;
        log::info!(
            "{}: {} (composite {:.2}, threshold {:.2})",
            verdict.individual_id,
            verdict.level,
            verdict.composite,
            self.threshold
        );
        Ok(())
    }
}
