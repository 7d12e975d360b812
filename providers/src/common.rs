use std::collections::HashSet;
use std::sync::Mutex;

use marcus_core::error::{CoreError, Result};
use marcus_core::provider::IdempotencyKey;

/// Per-process replay guard for providers whose APIs have no native
/// idempotency. First use of a key wins; replays become no-ops.
#[derive(Debug, Default)]
pub(crate) struct ReplayGuard {
    seen: Mutex<HashSet<String>>,
}

impl ReplayGuard {
    /// Returns false when the key was already used.
    pub(crate) fn first_use(&self, key: &IdempotencyKey) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.as_str().to_string())
    }
}

/// Shared HTTP client with the timeout discipline every provider uses.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .connect_timeout(std::time::Duration::from_secs(5))
        .user_agent(concat!("marcus-server/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| CoreError::ProviderUnavailable(format!("http client: {e}")))
}

/// Map a transport error; these are always retryable.
pub(crate) fn transport_err(context: &str, err: reqwest::Error) -> CoreError {
    CoreError::ProviderUnavailable(format!("{context}: {err}"))
}

/// Check an HTTP response status, draining the body into the error message
/// on failure so operators see what the backend said.
pub(crate) async fn check_status(
    context: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    Err(CoreError::ProviderUnavailable(format!("{context}: HTTP {status}: {snippet}")))
}

/// Hidden marker embedded in card bodies so cards can be re-associated with
/// task ids after a restart.
pub(crate) fn task_marker(task_id: &str) -> String {
    format!("<!-- marcus:{task_id} -->")
}

/// Extract the task id from a marked body.
pub(crate) fn parse_marker(body: &str) -> Option<&str> {
    let start = body.find("<!-- marcus:")? + "<!-- marcus:".len();
    let rest = &body[start..];
    let end = rest.find(" -->")?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_round_trips() {
        let marker = task_marker("t-42");
        let body = format!("Build the API\n\n{marker}");
        assert_eq!(parse_marker(&body), Some("t-42"));
        assert_eq!(parse_marker("no marker here"), None);
    }

    #[test]
    fn replay_guard_admits_each_key_once() {
        let guard = ReplayGuard::default();
        let key = IdempotencyKey::derive("status", "t-1", 1);
        assert!(guard.first_use(&key));
        assert!(!guard.first_use(&key));
        assert!(guard.first_use(&IdempotencyKey::derive("status", "t-1", 2)));
    }
}
