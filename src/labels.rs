use std::collections::BTreeSet;

use crate::config::LabelsConfig;

/// Split of the classifier's label set into non-stress and stress labels.
///
/// Only the non-stress side is listed; every other label, including indices
/// the configuration does not name, is a stress signal.
#[derive(Debug, Clone)]
pub struct LabelPartition {
    names: Vec<String>,
    non_stress: BTreeSet<usize>,
}

impl LabelPartition {
    pub fn new(names: Vec<String>, non_stress: impl IntoIterator<Item = usize>) -> Self {
        Self {
            names,
            non_stress: non_stress.into_iter().collect(),
        }
    }

    pub fn from_config(cfg: &LabelsConfig) -> Self {
        Self::new(cfg.names.clone(), cfg.non_stress.iter().copied())
    }

    pub fn is_stress(&self, label: usize) -> bool {
        !self.non_stress.contains(&label)
    }

    pub fn label_count(&self) -> usize {
        self.names.len()
    }

    pub fn name(&self, label: usize) -> &str {
        self.names.get(label).map(String::as_str).unwrap_or("unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_partition() {
        let p = LabelPartition::from_config(&LabelsConfig::default());
        assert_eq!(p.label_count(), 7);
        for label in [0, 1, 2, 4] {
            assert!(!p.is_stress(label), "{} should be non-stress", p.name(label));
        }
        for label in [3, 5, 6] {
            assert!(p.is_stress(label), "{} should be stress", p.name(label));
        }
    }

    #[test]
    fn test_unlisted_labels_are_stress() {
        let p = LabelPartition::new(vec!["calm".into(), "tense".into()], [0]);
        assert!(!p.is_stress(0));
        assert!(p.is_stress(1));
        assert!(p.is_stress(42));
        assert_eq!(p.name(42), "unknown");
    }
}
