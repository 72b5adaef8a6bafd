use crate::payments::error::PaymentError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GatewayName {
    Cpu,
}

impl GatewayName {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayName::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for GatewayName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GatewayName {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "cpu" | "ceepos" => Ok(GatewayName::Cpu),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported gateway: {}", value),
                field: Some("gateway".to_string()),
            }),
        }
    }
}

/// Who is paying, as far as the gateway needs to know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayerInfo {
    pub email: Option<String>,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    /// UI language code, e.g. "fi", "sv", "en"
    pub language: Option<String>,
}

/// One fine as handed to the gateway when building the payment request.
/// The gateway derives the product row (code, sanitized description) itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineSnapshot {
    pub fine_reference: String,
    pub fine_type: String,
    pub title: Option<String>,
    pub organization: Option<String>,
    /// Minor currency units
    pub amount: i64,
}

#[derive(Debug, Clone)]
pub struct StartPaymentRequest {
    /// External correlation key, already embedded in the URLs below
    pub transaction_id: String,
    pub return_url: String,
    pub notify_url: String,
    pub payer: PayerInfo,
    pub fines: Vec<FineSnapshot>,
    /// Service charge in minor units; zero means no fee row is sent
    pub transaction_fee: i64,
    pub currency: String,
}

/// Where to send the user agent after the gateway accepted the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectInstruction {
    pub url: String,
    pub provider_reference: Option<String>,
}

/// An inbound gateway callback, reduced to its parameters.
///
/// Providers deliver fields in the query string, form post, or a JSON body
/// depending on the channel; `field` resolves them with the JSON body taking
/// precedence, which matches how the reference gateway delivers its notify
/// channel.
#[derive(Debug, Clone, Default)]
pub struct CallbackRequest {
    pub params: HashMap<String, String>,
    pub json: Option<JsonValue>,
}

impl CallbackRequest {
    pub fn from_params(params: HashMap<String, String>) -> Self {
        Self { params, json: None }
    }

    pub fn field(&self, name: &str) -> Option<String> {
        if let Some(json) = &self.json {
            if let Some(value) = json.get(name) {
                return match value {
                    JsonValue::String(s) => Some(s.clone()),
                    JsonValue::Number(n) => Some(n.to_string()),
                    _ => None,
                };
            }
        }
        self.params.get(name).cloned()
    }
}

/// Outcome of a validated callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    Success,
    Cancelled,
    Failed { reason: String },
}

/// Result of signature verification plus status mapping.
#[derive(Debug, Clone)]
pub struct ValidatedCallback {
    pub outcome: CallbackOutcome,
    pub transaction_id: String,
    pub provider_reference: String,
}
