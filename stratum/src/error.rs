use thiserror::Error;

/// Stratum-level rejections sent back to the worker. These are part of the
/// wire protocol, not Rust failure paths: every variant maps to a numeric
/// error code miners already understand.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StratumError {
    #[error("stale share")]
    StaleShare,
    #[error("duplicate share")]
    DuplicateShare,
    #[error("low difficulty share ({0})")]
    LowDifficultyShare(f64),
    #[error("unauthorized worker")]
    UnauthorizedWorker,
    #[error("not subscribed")]
    NotSubscribed,
    #[error("job not found")]
    JobNotFound,
    #[error("{0}")]
    Other(String),
}

impl StratumError {
    pub fn code(&self) -> i32 {
        match self {
            StratumError::StaleShare | StratumError::DuplicateShare => -1,
            StratumError::LowDifficultyShare(_) => 23,
            StratumError::UnauthorizedWorker => 24,
            StratumError::NotSubscribed => 25,
            StratumError::JobNotFound => -2,
            StratumError::Other(_) => 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_protocol() {
        assert_eq!(StratumError::StaleShare.code(), -1);
        assert_eq!(StratumError::DuplicateShare.code(), -1);
        assert_eq!(StratumError::LowDifficultyShare(500.0).code(), 23);
        assert_eq!(StratumError::UnauthorizedWorker.code(), 24);
        assert_eq!(StratumError::NotSubscribed.code(), 25);
        assert_eq!(StratumError::JobNotFound.code(), -2);
        assert_eq!(StratumError::Other("boom".into()).code(), 20);
    }

    #[test]
    fn low_difficulty_message_carries_ratio() {
        let err = StratumError::LowDifficultyShare(500.0);
        assert_eq!(err.to_string(), "low difficulty share (500)");
    }
}
