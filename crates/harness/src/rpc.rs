//! Shared JSON-RPC plumbing for talking to chain nodes.

use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::HarnessError;

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client(timeout: Duration) -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
///
/// A JSON `null` result is handed to the deserializer as is, so `T = Option<_>` can be used for
/// lookups that may legitimately return nothing (unknown blocks, pending receipts).
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, anyhow::Error> {
    let response = client
        .post(url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .with_context(|| format!("Failed to send {} request", method))?;

    let result: Value = response
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", method))?;

    if let Some(error) = result.get("error") {
        anyhow::bail!(
            "RPC error from {}: {}",
            method,
            error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
        );
    }

    let result_value = result
        .get("result")
        .context("No result in response")?
        .clone();

    serde_json::from_value(result_value)
        .with_context(|| format!("Failed to deserialize {} result", method))
}

/// Wait for a chain to be ready by repeatedly calling a check function.
///
/// The check is attempted at most `attempts` times with `interval` between failed attempts.
/// Exhausting the budget yields [`HarnessError::StartupTimeout`].
pub async fn wait_until_ready<F, Fut>(
    chain_id: u64,
    attempts: usize,
    interval: Duration,
    check_fn: F,
) -> Result<(), anyhow::Error>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), anyhow::Error>>,
{
    for attempt in 1..=attempts {
        match check_fn().await {
            Ok(()) => {
                tracing::debug!(chain_id, attempt, "Chain answered liveness query");
                return Ok(());
            }
            Err(e) => {
                tracing::trace!(error = %e, chain_id, attempt, "Readiness check failed, retrying...");
            }
        }

        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }

    Err(HarnessError::StartupTimeout { chain_id, attempts }.into())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[tokio::test]
    async fn test_wait_until_ready_exhausts_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let err = wait_until_ready(7, 3, Duration::from_millis(1), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("connection refused")
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::StartupTimeout {
                chain_id: 7,
                attempts: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_wait_until_ready_returns_on_first_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        wait_until_ready(7, 5, Duration::from_millis(1), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                    anyhow::bail!("not yet");
                }
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
