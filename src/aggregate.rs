use serde::{Deserialize, Serialize};

/// Running count of stress signals within one video.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalTally {
    pub stressed: usize,
    pub total: usize,
}

impl SignalTally {
    pub fn record(&mut self, stressed: bool) {
        self.total += 1;
        if stressed {
            self.stressed += 1;
        }
    }

    /// Percentage of stressed signals, `None` when nothing was classified.
    pub fn percentage(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.stressed as f64 / self.total as f64 * 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoScore {
    pub video_id: String,
    pub sequence_index: u32,
    pub faces: usize,
    pub stressed_percentage: f64,
}

impl VideoScore {
    pub fn from_tally(video_id: String, sequence_index: u32, tally: &SignalTally) -> Option<Self> {
        Some(Self {
            video_id,
            sequence_index,
            faces: tally.total,
            stressed_percentage: tally.percentage()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    pub individual_id: String,
    pub value: f64,
}

/// Arithmetic mean of the defined video scores; `None` for no scores.
pub fn composite(individual_id: &str, scores: &[VideoScore]) -> Option<CompositeScore> {
    if scores.is_empty() {
        return None;
    }
    let sum: f64 = scores.iter().map(|s| s.stressed_percentage).sum();
    let value = (sum / scores.len() as f64).clamp(0.0, 100.0);
    Some(CompositeScore {
        individual_id: individual_id.to_string(),
        value,
    })
}
