//! The fixed stage pipeline and its progress weight schedule.
//!
//! Every flow runs the same ordered pipeline; only
//! `structured_data_generation` is conditional on the configuration.
//! The per-stage weights fold stage completions into the overall
//! progress percentage, with `content_generation` as the dominant slice.

use serde::{Deserialize, Serialize};

use crate::config::FlowConfiguration;
use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One named step of the fixed pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preparing,
    DataLoading,
    FormatAnalysis,
    ContentGeneration,
    FormatCorrection,
    StructuredDataGeneration,
    QualityValidation,
    ResultStorage,
}

/// All stages in pipeline order.
pub const PIPELINE: [Stage; 8] = [
    Stage::Preparing,
    Stage::DataLoading,
    Stage::FormatAnalysis,
    Stage::ContentGeneration,
    Stage::FormatCorrection,
    Stage::StructuredDataGeneration,
    Stage::QualityValidation,
    Stage::ResultStorage,
];

impl Stage {
    /// Return the wire-format string for this variant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::DataLoading => "data_loading",
            Self::FormatAnalysis => "format_analysis",
            Self::ContentGeneration => "content_generation",
            Self::FormatCorrection => "format_correction",
            Self::StructuredDataGeneration => "structured_data_generation",
            Self::QualityValidation => "quality_validation",
            Self::ResultStorage => "result_storage",
        }
    }

    /// Parse from a wire-format string.
    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        PIPELINE
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| CoreError::Internal(format!("Unknown stage: '{s}'")))
    }

    /// Zero-based position of this stage in the pipeline.
    pub fn index(&self) -> usize {
        PIPELINE
            .iter()
            .position(|stage| stage == self)
            .unwrap_or(0)
    }

    /// The stage that follows this one, or `None` at pipeline end.
    pub fn next(&self) -> Option<Stage> {
        PIPELINE.get(self.index() + 1).copied()
    }

    /// Contribution of this stage to the overall progress percentage.
    ///
    /// The schedule sums to exactly 100. `content_generation` carries the
    /// dominant slice because it does nearly all the work.
    pub fn weight(&self) -> u32 {
        match self {
            Self::Preparing => 5,
            Self::DataLoading => 5,
            Self::FormatAnalysis => 5,
            Self::ContentGeneration => 60,
            Self::FormatCorrection => 10,
            Self::StructuredDataGeneration => 5,
            Self::QualityValidation => 5,
            Self::ResultStorage => 5,
        }
    }

    /// Whether this stage executes for the given configuration.
    ///
    /// A disabled stage still appears in the attempt history with status
    /// `skipped`; its weight still counts toward overall progress so the
    /// percentage reaches 100 either way.
    pub fn is_enabled(&self, config: &FlowConfiguration) -> bool {
        match self {
            Self::StructuredDataGeneration => config.enable_structured_data,
            _ => true,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Progress helpers
// ---------------------------------------------------------------------------

/// Overall progress percentage after `stage` has completed.
///
/// Sums the weights of every stage up to and including `stage`. Used both
/// when folding a completed stage into the progress snapshot and as the
/// baseline when resuming from a checkpoint.
pub fn progress_through(stage: Stage) -> u32 {
    PIPELINE
        .iter()
        .take(stage.index() + 1)
        .map(|s| s.weight())
        .sum()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_one_hundred() {
        let total: u32 = PIPELINE.iter().map(|s| s.weight()).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn content_generation_is_dominant() {
        for stage in PIPELINE {
            if stage != Stage::ContentGeneration {
                assert!(stage.weight() < Stage::ContentGeneration.weight());
            }
        }
    }

    #[test]
    fn pipeline_order_is_fixed() {
        assert_eq!(PIPELINE[0], Stage::Preparing);
        assert_eq!(PIPELINE[3], Stage::ContentGeneration);
        assert_eq!(PIPELINE[7], Stage::ResultStorage);
    }

    #[test]
    fn next_walks_the_pipeline() {
        assert_eq!(Stage::Preparing.next(), Some(Stage::DataLoading));
        assert_eq!(
            Stage::QualityValidation.next(),
            Some(Stage::ResultStorage)
        );
        assert_eq!(Stage::ResultStorage.next(), None);
    }

    #[test]
    fn index_matches_position() {
        for (i, stage) in PIPELINE.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
    }

    #[test]
    fn as_str_from_str_roundtrip() {
        for stage in PIPELINE {
            assert_eq!(Stage::from_str(stage.as_str()).unwrap(), stage);
        }
    }

    #[test]
    fn unknown_stage_rejected() {
        assert!(Stage::from_str("rendering").is_err());
    }

    #[test]
    fn structured_data_conditional_on_config() {
        let mut config =
            crate::config::FlowConfiguration::new("w1", vec!["g1".to_string()]);
        assert!(!Stage::StructuredDataGeneration.is_enabled(&config));

        config.enable_structured_data = true;
        assert!(Stage::StructuredDataGeneration.is_enabled(&config));
        assert!(Stage::ContentGeneration.is_enabled(&config));
    }

    #[test]
    fn progress_through_is_monotone() {
        let mut last = 0;
        for stage in PIPELINE {
            let p = progress_through(stage);
            assert!(p > last);
            last = p;
        }
        assert_eq!(progress_through(Stage::ResultStorage), 100);
    }

    #[test]
    fn progress_through_content_generation() {
        // 5 + 5 + 5 + 60
        assert_eq!(progress_through(Stage::ContentGeneration), 75);
    }
}
