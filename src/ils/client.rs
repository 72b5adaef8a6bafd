//! HTTP implementation of the ILS connector.

use crate::ils::{Fine, IlsConnector, IlsError, IlsResult, PatronAccount, PayableCheck};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct IlsClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl IlsClientConfig {
    pub fn from_env() -> IlsResult<Self> {
        let base_url = std::env::var("ILS_BASE_URL").map_err(|_| IlsError::Rejected {
            message: "ILS_BASE_URL environment variable is required".to_string(),
        })?;
        Ok(Self {
            base_url,
            api_key: std::env::var("ILS_API_KEY").ok(),
            timeout_secs: std::env::var("ILS_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
        })
    }
}

pub struct IlsHttpClient {
    config: IlsClientConfig,
    client: reqwest::Client,
}

impl IlsHttpClient {
    pub fn new(config: IlsClientConfig) -> IlsResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IlsError::Network {
                message: format!("failed to initialize HTTP client: {}", e),
            })?;
        Ok(Self { config, client })
    }

    pub fn from_env() -> IlsResult<Self> {
        Self::new(IlsClientConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn classify(&self, err: reqwest::Error) -> IlsError {
        if err.is_timeout() {
            IlsError::Timeout {
                timeout_secs: self.config.timeout_secs,
            }
        } else {
            IlsError::Network {
                message: err.to_string(),
            }
        }
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> IlsResult<T> {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(IlsError::Rejected {
                message: format!("HTTP {}: {}", status, text),
            });
        }
        serde_json::from_str::<T>(&text).map_err(|e| IlsError::InvalidResponse {
            message: format!("{}: {}", e, text),
        })
    }
}

#[async_trait]
impl IlsConnector for IlsHttpClient {
    async fn get_payable_fines(
        &self,
        patron: &PatronAccount,
        selected_fine_ids: &[String],
    ) -> IlsResult<PayableCheck> {
        let url = self.endpoint(&format!(
            "/patrons/{}/{}/fines/payable",
            patron.driver, patron.patron_id
        ));

        let mut request = self.client.get(&url);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        if !selected_fine_ids.is_empty() {
            request = request.query(&[("fine_ids", selected_fine_ids.join(","))]);
        }

        let response = request.send().await.map_err(|e| self.classify(e))?;
        let check: PayableCheck = self.parse_response(response).await?;

        let PayableCheck {
            payable,
            amount,
            fines,
            reason,
        } = check;
        let fines: Vec<Fine> = fines.into_iter().filter(|f| f.payable_online).collect();
        Ok(PayableCheck {
            payable,
            amount,
            fines,
            reason,
        })
    }

    async fn mark_fees_as_paid(
        &self,
        patron: &PatronAccount,
        amount: i64,
        transaction_id: &str,
        transaction_number: i64,
        fine_ids: &[String],
    ) -> IlsResult<bool> {
        let url = self.endpoint(&format!(
            "/patrons/{}/{}/fines/payments",
            patron.driver, patron.patron_id
        ));

        let payload = serde_json::json!({
            "amount": amount,
            "transaction_id": transaction_id,
            "transaction_number": transaction_number,
            "fine_ids": fine_ids,
        });

        let mut request = self.client.post(&url).json(&payload);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.classify(e))?;
        let result: MarkPaidResponse = self.parse_response(response).await?;

        if result.success {
            info!(
                transaction_id = %transaction_id,
                patron_id = %patron.patron_id,
                "fees registered as paid in ILS"
            );
        } else {
            warn!(
                transaction_id = %transaction_id,
                patron_id = %patron.patron_id,
                reason = result.reason.as_deref().unwrap_or("unspecified"),
                "ILS refused fee registration"
            );
        }
        Ok(result.success)
    }
}

#[derive(Debug, Deserialize)]
struct MarkPaidResponse {
    success: bool,
    #[serde(default)]
    reason: Option<String>,
}
