use thiserror::Error;

/// Typed failures surfaced by channel operations.
///
/// Busy and vanished transports are ordinarily reported through the outcome
/// enums on [`crate::transport::Transport`]; the variants here appear only
/// where such a condition must cross an API boundary as an error (no-backlog
/// sends, registry misuse) or where the caller broke the comm's contract.
#[derive(Debug, Error)]
pub enum CommError {
    /// The transport temporarily cannot accept another message. Retryable.
    #[error("transport is full, retry later")]
    TransportFull,

    /// The transport resource behind the given key no longer exists.
    #[error("transport '{key}' is gone")]
    TransportGone { key: String },

    /// The registry was asked to drop a key it does not hold.
    #[error("registration conflict for key '{key}'")]
    RegistrationConflict { key: String },

    /// The caller used the comm outside its declared contract, e.g. sending
    /// on a receive-direction comm or using one that was never opened.
    #[error("contract violation: {0}")]
    ContractViolation(&'static str),

    /// Any other backend failure, carried with its context intact.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type Result<T, E = CommError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formatting() {
        let err = CommError::TransportGone {
            key: "1234".to_string(),
        };
        assert_eq!(err.to_string(), "transport '1234' is gone");

        let err = CommError::RegistrationConflict {
            key: "mem-x".to_string(),
        };
        assert_eq!(err.to_string(), "registration conflict for key 'mem-x'");

        let err = CommError::ContractViolation("send on a receive comm");
        assert_eq!(
            err.to_string(),
            "contract violation: send on a receive comm"
        );
    }

    #[test]
    fn test_backend_preserves_context() {
        let err = CommError::from(anyhow::anyhow!("msgget failed: EACCES"));
        assert!(err.to_string().contains("EACCES"));
        assert!(matches!(err, CommError::Backend(_)));
    }
}
