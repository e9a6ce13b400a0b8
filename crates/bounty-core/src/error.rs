use thiserror::Error;

/// Settlement core errors.
///
/// Every variant maps to a stable `kind()` code so command surfaces can
/// render a tagged failure instead of an opaque message.
#[derive(Debug, Error)]
pub enum BountyError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Report '{report_id}' is already settled (status '{status}')")]
    AlreadySettled { report_id: String, status: String },

    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Insufficient balance for coin '{coin}': required {required}, available {available}")]
    InsufficientBalance {
        coin: String,
        required: String,
        available: String,
    },

    #[error("Ledger conflict on token '{0}': request already exists")]
    LedgerConflict(String),

    #[error("All candidate tokens for coin '{coin}' exhausted after {attempts} conflict(s)")]
    CandidatesExhausted { coin: String, attempts: usize },

    #[error("Ledger timeout: {0}")]
    LedgerTimeout(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BountyError {
    /// Stable snake_case code for tagged failure results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::AlreadySettled { .. } => "already_settled",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::LedgerConflict(_) => "ledger_conflict",
            Self::CandidatesExhausted { .. } => "conflict_exhausted",
            Self::LedgerTimeout(_) => "ledger_timeout",
            Self::Ledger(_) => "ledger",
            Self::Transport(_) => "transport",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
        }
    }

    pub fn illegal_transition(from: &str, to: &str) -> Self {
        Self::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<sqlx::Error> for BountyError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BountyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for BountyError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct_for_surface_rendering() {
        let timeout = BountyError::LedgerTimeout("proof".to_string());
        let exhausted = BountyError::CandidatesExhausted {
            coin: "x".to_string(),
            attempts: 2,
        };
        assert_eq!(timeout.kind(), "ledger_timeout");
        assert_eq!(exhausted.kind(), "conflict_exhausted");
        assert!(exhausted.to_string().contains("2 conflict(s)"));
    }
}
