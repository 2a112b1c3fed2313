//! Error classification for HTTP retries.

use reqwest::StatusCode;
use std::time::Duration;

/// Maximum number of attempts for idempotent reads.
pub const MAX_RETRIES: usize = 3;

/// Delay before the first retry; doubled for every further attempt.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Errors that will not go away by asking again.
#[derive(Debug, thiserror::Error)]
pub enum NonRetryableError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Too many requests: {0}. Try again later")]
    RateLimited(String),

    #[error("Request error: {0}")]
    ClientError(String),
}

/// Classifies a failed response. `Ok(())` means the failure is transient.
pub fn classify_error(error: &reqwest::Error) -> Result<(), NonRetryableError> {
    let Some(status) = error.status() else {
        // Connection errors, timeouts and the like
        return Ok(());
    };
    let url = error
        .url()
        .map(|u| u.to_string())
        .unwrap_or_else(|| "request".to_string());

    match status {
        StatusCode::NOT_FOUND => Err(NonRetryableError::NotFound(url)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(NonRetryableError::Forbidden(url)),
        StatusCode::TOO_MANY_REQUESTS => Err(NonRetryableError::RateLimited(url)),
        s if s.is_client_error() => Err(NonRetryableError::ClientError(format!(
            "HTTP {} for {}",
            s.as_u16(),
            url
        ))),
        _ => Ok(()),
    }
}

/// Converts an `error_for_status()` failure, tagging it non-retryable when
/// the status says so.
pub fn check_retryable(error: reqwest::Error) -> anyhow::Error {
    match classify_error(&error) {
        Ok(()) => anyhow::Error::from(error),
        Err(non_retryable) => anyhow::Error::from(non_retryable),
    }
}

pub fn is_retryable(error: &anyhow::Error) -> bool {
    error.downcast_ref::<NonRetryableError>().is_none()
}

/// Backoff before attempt `attempt + 1`, starting from `initial`.
pub fn backoff_delay(initial: Duration, attempt: usize) -> Duration {
    let shift = attempt.saturating_sub(1).min(16) as u32;
    initial.saturating_mul(1 << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let initial = Duration::from_millis(100);
        assert_eq!(backoff_delay(initial, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(initial, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(initial, 3), Duration::from_millis(400));
    }

    #[test]
    fn test_non_retryable_display() {
        let err = NonRetryableError::NotFound("http://x/index.json".into());
        assert!(err.to_string().contains("Not found"));
        assert!(!is_retryable(&anyhow::Error::from(err)));
        assert!(is_retryable(&anyhow::anyhow!("connection reset")));
    }

    #[tokio::test]
    async fn test_classify_statuses() {
        let mut server = mockito::Server::new_async().await;
        let _m404 = server.mock("GET", "/missing").with_status(404).create_async().await;
        let _m500 = server.mock("GET", "/broken").with_status(500).create_async().await;
        let _m400 = server.mock("GET", "/bad").with_status(400).create_async().await;

        let client = reqwest::Client::new();
        for (path, retryable) in [("/missing", false), ("/broken", true), ("/bad", false)] {
            let err = client
                .get(format!("{}{}", server.url(), path))
                .send()
                .await
                .unwrap()
                .error_for_status()
                .unwrap_err();
            assert_eq!(classify_error(&err).is_ok(), retryable, "{}", path);
        }
    }
}
