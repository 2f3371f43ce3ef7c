/// Rejected environment configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvironmentError {
    #[error("{field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("at least one season must be configured")]
    NoSeasons,

    #[error("weather override for unknown biome '{0}'")]
    UnknownBiome(String),
}

impl EnvironmentError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
