//! # Engine Errors
//!
//! Failure classes that callers are expected to branch on. Anything without a
//! local recovery travels as `Other` with its cause chain intact.

use crate::provider::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transaction watcher needs to be started")]
    WatcherNotStarted,

    #[error("tx receipt watcher timed out after {attempts} attempts")]
    ReceiptTimeout { attempts: u64 },

    #[error("no provider configured for network {0}")]
    MissingProvider(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{context}")]
    Collaborator {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn collaborator(context: impl Into<String>, source: anyhow::Error) -> Self {
        EngineError::Collaborator {
            context: context.into(),
            source,
        }
    }

    /// Display text followed by every cause in the chain.
    pub fn full_message(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }

    /// Poll-phase failures that put the transaction into the timed-out path
    /// instead of surfacing to the caller.
    pub fn is_poll_failure(&self) -> bool {
        matches!(
            self,
            EngineError::ReceiptTimeout { .. }
                | EngineError::MissingProvider(_)
                | EngineError::Provider(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_message_includes_causes() {
        let err = EngineError::collaborator(
            "Failed to rescan history",
            anyhow::anyhow!("transaction failed"),
        );
        assert_eq!(err.to_string(), "Failed to rescan history");
        assert_eq!(err.full_message(), "Failed to rescan history: transaction failed");
        assert!(!err.is_poll_failure());
        assert!(EngineError::ReceiptTimeout { attempts: 40 }.is_poll_failure());
    }
}
