use helm_core::errors::GatewayError;
use helm_core::ids::SessionId;
use helm_core::tools::ToolError;
use helm_store::StoreError;

use crate::subagent::RegistryError;

/// Errors returned by a run and by the coordinator.
///
/// The first four variants are local preconditions. They are never retried.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session {0} already has a run in progress")]
    SessionBusy(SessionId),

    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("session missing: {0}")]
    SessionMissing(String),

    #[error("request cancelled")]
    RequestCancelled,

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("subagent registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("max turns exceeded: {0}")]
    MaxTurnsExceeded(u32),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// True for the caller-misuse and cancellation variants.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::SessionBusy(_) | Self::EmptyPrompt | Self::SessionMissing(_) | Self::RequestCancelled
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::RequestCancelled | Self::Gateway(GatewayError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_core::classify::is_input_too_long_error;
    use helm_core::errors::ProviderError;

    #[test]
    fn provider_error_reachable_through_engine_error() {
        let err = EngineError::from(GatewayError::from(ProviderError::new(
            413,
            "Input is too long for requested model",
        )));
        assert!(is_input_too_long_error(&err));
        assert!(!err.is_precondition());
    }

    #[test]
    fn precondition_variants() {
        assert!(EngineError::EmptyPrompt.is_precondition());
        assert!(EngineError::SessionBusy(SessionId::new()).is_precondition());
        assert!(EngineError::RequestCancelled.is_cancelled());
        assert!(!EngineError::MaxTurnsExceeded(3).is_precondition());
    }
}
