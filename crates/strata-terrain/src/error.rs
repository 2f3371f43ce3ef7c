//! Error and diagnostic types shared by every generation stage.

use serde::{Deserialize, Serialize};

use crate::poi::PoiId;
use crate::stage::Stage;

/// A generation request was rejected before any stage ran.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Width or height of the region is zero.
    #[error("region extent must be positive, got {width}x{height}")]
    NonPositiveExtent {
        /// Requested width in cells.
        width: u32,
        /// Requested height in cells.
        height: u32,
    },

    /// A noise field was configured with no octaves.
    #[error("{field}: octave count must be at least 1")]
    ZeroOctaves {
        /// Dotted path of the offending noise config.
        field: String,
    },

    /// A numeric parameter is out of its valid range.
    #[error("{field}: {reason}")]
    InvalidValue {
        /// Dotted path of the offending parameter.
        field: String,
        /// Human-readable constraint that was violated.
        reason: String,
    },

    /// The biome rule table has no rules.
    #[error("biome rule table is empty")]
    EmptyRuleTable,

    /// A biome rule has an inverted or non-finite range.
    #[error("biome rule {index} ({biome}): {reason}")]
    InvalidBiomeRule {
        /// Position of the rule in the table.
        index: usize,
        /// Biome the rule assigns.
        biome: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A rule or table references a biome that is not defined.
    #[error("unknown biome '{0}'")]
    UnknownBiome(String),

    /// Two biome definitions share a name.
    #[error("duplicate biome name: {0}")]
    DuplicateBiome(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors produced inside a running stage.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    /// The stage cannot produce valid output for this input.
    #[error("{0}")]
    Failed(String),

    /// Memory or worker allocation failed mid-stage.
    #[error("resource exhaustion: {0}")]
    Exhausted(String),

    /// Cooperative cancellation was observed.
    #[error("cancelled")]
    Cancelled,
}

/// Why a generation run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailureReason {
    /// A stage could not produce valid output; all stage data was discarded.
    #[error("stage {stage:?} failed: {message}")]
    StageFailure {
        /// Stage that failed.
        stage: Stage,
        /// Failure description.
        message: String,
    },

    /// Allocation of memory or worker threads failed.
    #[error("resource exhaustion in {stage:?}: {message}")]
    ResourceExhaustion {
        /// Stage that was running (or about to run).
        stage: Stage,
        /// Failure description.
        message: String,
    },

    /// A stage panicked on a worker thread.
    #[error("worker panicked while running {stage:?}")]
    WorkerPanicked {
        /// Stage that panicked.
        stage: Stage,
    },
}

impl FailureReason {
    pub(crate) fn from_stage_error(stage: Stage, error: StageError) -> Option<Self> {
        match error {
            StageError::Failed(message) => Some(Self::StageFailure { stage, message }),
            StageError::Exhausted(message) => Some(Self::ResourceExhaustion { stage, message }),
            StageError::Cancelled => None,
        }
    }
}

/// Non-fatal problems attached to a successful result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Diagnostic {
    /// Some POIs could not be joined to the main road network.
    RoadNetworkDisconnected {
        /// POIs outside the main connected component.
        unreachable: Vec<PoiId>,
    },
    /// Roads only connected after relaxing passability.
    RoadsRelaxed {
        /// Relaxation level that produced the final network.
        level: u32,
    },
    /// Fewer POIs than requested satisfied the separation rule.
    PoiShortfall {
        /// Requested POI count.
        requested: u32,
        /// POIs actually selected.
        placed: u32,
    },
    /// Placement stopped well short of its density target.
    PlacementShortfall {
        /// Objects the density table asked for.
        target: usize,
        /// Objects accepted.
        placed: usize,
    },
    /// A downstream sink rejected the committed result.
    SinkRejected {
        /// Sink that failed.
        sink: String,
        /// Error text.
        message: String,
    },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoadNetworkDisconnected { unreachable } => {
                write!(f, "{} POI(s) unreachable by road", unreachable.len())
            }
            Self::RoadsRelaxed { level } => {
                write!(f, "road network required passability relaxation level {level}")
            }
            Self::PoiShortfall { requested, placed } => {
                write!(f, "placed {placed} of {requested} requested POIs")
            }
            Self::PlacementShortfall { target, placed } => {
                write!(f, "placed {placed} objects against a target of {target}")
            }
            Self::SinkRejected { sink, message } => write!(f, "{sink} sink failed: {message}"),
        }
    }
}
