//! Timeout wrapper for stage calls
//!
//! Stage calls wrap whole LLM generations, so the budget covers the request and
//! reading the body rather than only the connect phase.

use std::future::Future;
use std::time::Duration;

use crate::types::{FlowError, Result};

/// Execute an async operation with a timeout
///
/// Returns [`FlowError::Timeout`] if the operation doesn't finish within `timeout`.
///
/// ```ignore
/// let reply = with_timeout(
///     Duration::from_secs(300),
///     async { backend.invoke(StreamAction::Case, &session, data).await },
///     "case generation",
/// )
/// .await?;
/// ```
pub async fn with_timeout<T, F>(timeout: Duration, future: F, operation_name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(FlowError::timeout(operation_name, timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::codes;

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(
            Duration::from_secs(1),
            async { Ok::<_, FlowError>(42) },
            "test operation",
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result = with_timeout(
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, FlowError>(42)
            },
            "scenario generation",
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, FlowError::Timeout { .. }));
        assert_eq!(err.classify().code(), codes::TIMEOUT_ERROR);
    }
}
