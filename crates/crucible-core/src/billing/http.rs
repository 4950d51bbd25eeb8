//! REST client for the credit ledger.

use super::{Ledger, LedgerError, LedgerResult};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

pub struct HttpLedger {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

#[derive(Deserialize)]
struct BalanceResponse {
    available: u64,
}

#[derive(Serialize)]
struct ChargeBody<'a> {
    user_id: &'a str,
    points: u64,
    reference: &'a str,
}

#[derive(Deserialize)]
struct ChargeResponse {
    transaction_id: String,
}

#[derive(Serialize)]
struct AmountBody {
    points: u64,
}

impl HttpLedger {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> LedgerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Unavailable(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { base_url: base_url.into().trim_end_matches('/').to_string(), api_key, client })
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> LedgerResult<Response> {
        let request = match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        };
        let response = request.send().await.map_err(|e| {
            error!(error = %e, operation = what, "Ledger request failed");
            LedgerError::Unavailable(format!("{what}: {e}"))
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LedgerError::Unavailable(format!("{what}: {status} {body}")));
        }
        Err(LedgerError::Rejected { status: status.as_u16(), message: body })
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn check_balance(&self, user_id: &str, points: u64) -> LedgerResult<bool> {
        let request = self.client.get(format!("{}/balances/{user_id}", self.base_url));
        let balance: BalanceResponse = self
            .send(request, "check balance")
            .await?
            .json()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("balance response: {e}")))?;
        Ok(balance.available >= points)
    }

    async fn charge(&self, user_id: &str, points: u64, job_id: &str) -> LedgerResult<String> {
        let request = self
            .client
            .post(format!("{}/charges", self.base_url))
            .json(&ChargeBody { user_id, points, reference: job_id });
        let charge: ChargeResponse = match self.send(request, "charge").await {
            Ok(response) => response
                .json()
                .await
                .map_err(|e| LedgerError::Unavailable(format!("charge response: {e}")))?,
            Err(LedgerError::Rejected { status: 402, .. }) => {
                return Err(LedgerError::InsufficientFunds { available: 0, required: points });
            }
            Err(e) => return Err(e),
        };
        info!(user_id, points, job_id, transaction_id = %charge.transaction_id, "Charged user");
        Ok(charge.transaction_id)
    }

    async fn refund(&self, transaction_id: &str, points: u64) -> LedgerResult<()> {
        let request = self
            .client
            .post(format!("{}/charges/{transaction_id}/refunds", self.base_url))
            .json(&AmountBody { points });
        self.send(request, "refund").await?;
        Ok(())
    }

    async fn flag_overrun(&self, transaction_id: &str, points: u64) -> LedgerResult<()> {
        let request = self
            .client
            .post(format!("{}/charges/{transaction_id}/flags", self.base_url))
            .json(&AmountBody { points });
        self.send(request, "flag overrun").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(url: String) -> HttpLedger {
        HttpLedger::new(url, None, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_check_balance_compares_available() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/balances/user-1")
            .with_status(200)
            .with_body(r#"{"available": 20000}"#)
            .expect(2)
            .create_async()
            .await;

        let ledger = ledger(server.url());
        assert!(ledger.check_balance("user-1", 15_800).await.unwrap());
        assert!(!ledger.check_balance("user-1", 20_001).await.unwrap());
    }

    #[tokio::test]
    async fn test_charge_returns_transaction() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/charges")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "user_id": "user-1", "points": 15800, "reference": "job-1"
            })))
            .with_status(201)
            .with_body(r#"{"transaction_id": "tx-42"}"#)
            .create_async()
            .await;

        let tx = ledger(server.url()).charge("user-1", 15_800, "job-1").await.unwrap();
        mock.assert_async().await;
        assert_eq!(tx, "tx-42");
    }

    #[tokio::test]
    async fn test_payment_required_is_insufficient_funds() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/charges").with_status(402).create_async().await;

        let err = ledger(server.url()).charge("user-1", 15_800, "job-1").await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { required: 15_800, .. }));
    }

    #[tokio::test]
    async fn test_refund_and_flag_paths() {
        let mut server = mockito::Server::new_async().await;
        let refund = server
            .mock("POST", "/charges/tx-42/refunds")
            .match_body(mockito::Matcher::Json(serde_json::json!({"points": 300})))
            .with_status(200)
            .create_async()
            .await;
        let flag = server.mock("POST", "/charges/tx-42/flags").with_status(200).create_async().await;

        let ledger = ledger(server.url());
        ledger.refund("tx-42", 300).await.unwrap();
        ledger.flag_overrun("tx-42", 120).await.unwrap();
        refund.assert_async().await;
        flag.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/balances/user-1").with_status(500).create_async().await;

        let err = ledger(server.url()).check_balance("user-1", 1).await.unwrap_err();
        assert!(matches!(err, LedgerError::Unavailable(_)));
    }
}
