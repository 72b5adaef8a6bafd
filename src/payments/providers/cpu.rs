//! CPU (Ceepos) gateway adapter.
//!
//! The gateway speaks JSON over HTTPS. Every request and response carries a
//! SHA-256 checksum over the `&`-joined canonical fields with the merchant
//! secret appended; callbacks are verified with the same scheme before any
//! field is trusted.

use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::gateway::GatewayAdapter;
use crate::payments::types::{
    CallbackOutcome, CallbackRequest, FineSnapshot, GatewayName, RedirectInstruction,
    StartPaymentRequest, ValidatedCallback,
};
use crate::payments::utils::{
    parse_code_mappings, resolve_product_code, sanitize_description, sha256_checksum,
    verify_sha256_checksum, PaymentHttpClient,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

// Gateway status codes
const STATUS_SUCCESS: i64 = 1;
const STATUS_CANCELLED: i64 = 0;
const STATUS_PENDING: i64 = 2;
const STATUS_ID_EXISTS: i64 = 97;
const STATUS_ERROR: i64 = 98;
const STATUS_INVALID_REQUEST: i64 = 99;

#[derive(Debug, Clone)]
pub struct CpuConfig {
    pub merchant_id: String,
    pub secret: String,
    pub url: String,
    pub product_code: String,
    pub transaction_fee_product_code: Option<String>,
    pub payment_description: Option<String>,
    /// `fineType=code` pairs, colon-separated
    pub product_code_mappings: String,
    /// `organization=code` pairs, colon-separated
    pub organization_product_code_mappings: String,
    /// `uiLanguage=gatewayCode` pairs, colon-separated
    pub supported_languages: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl CpuConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let require = |name: &str| {
            std::env::var(name).map_err(|_| PaymentError::ConfigurationError {
                message: format!("{} environment variable is required", name),
            })
        };

        Ok(Self {
            merchant_id: require("CPU_MERCHANT_ID")?,
            secret: require("CPU_SECRET")?,
            url: require("CPU_URL")?,
            product_code: require("CPU_PRODUCT_CODE")?,
            transaction_fee_product_code: std::env::var("CPU_TRANSACTION_FEE_PRODUCT_CODE").ok(),
            payment_description: std::env::var("CPU_PAYMENT_DESCRIPTION").ok(),
            product_code_mappings: std::env::var("CPU_PRODUCT_CODE_MAPPINGS").unwrap_or_default(),
            organization_product_code_mappings: std::env::var(
                "CPU_ORGANIZATION_PRODUCT_CODE_MAPPINGS",
            )
            .unwrap_or_default(),
            supported_languages: std::env::var("CPU_SUPPORTED_LANGUAGES")
                .unwrap_or_else(|_| "fi=1:sv=2:en=3".to_string()),
            timeout_secs: std::env::var("CPU_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
            max_retries: std::env::var("CPU_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(3),
        })
    }
}

pub struct CpuGateway {
    config: CpuConfig,
    http: PaymentHttpClient,
    type_mappings: HashMap<String, String>,
    organization_mappings: HashMap<String, String>,
    language_mappings: HashMap<String, String>,
}

impl CpuGateway {
    pub fn new(config: CpuConfig) -> PaymentResult<Self> {
        if config.merchant_id.trim().is_empty()
            || config.secret.trim().is_empty()
            || config.url.trim().is_empty()
        {
            return Err(PaymentError::ConfigurationError {
                message: "cpu gateway requires merchant_id, secret and url".to_string(),
            });
        }

        let http =
            PaymentHttpClient::new(Duration::from_secs(config.timeout_secs), config.max_retries)?;
        let type_mappings = parse_code_mappings(&config.product_code_mappings);
        let organization_mappings =
            parse_code_mappings(&config.organization_product_code_mappings);
        let language_mappings = parse_code_mappings(&config.supported_languages);
        Ok(Self {
            config,
            http,
            type_mappings,
            organization_mappings,
            language_mappings,
        })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(CpuConfig::from_env()?)
    }

    fn product_row(&self, fine: &FineSnapshot) -> serde_json::Value {
        let mut description = fine.fine_type.clone();
        if let Some(title) = fine.title.as_deref().filter(|t| !t.trim().is_empty()) {
            let room = crate::payments::utils::MAX_DESCRIPTION_LEN
                .saturating_sub(4 + description.chars().count());
            let truncated: String = title.chars().take(room).collect();
            description = format!("{} ({})", description, truncated);
        }
        let description = sanitize_description(&description);
        let description = (!description.is_empty()).then_some(description);

        let code = resolve_product_code(
            &self.config.product_code,
            &self.type_mappings,
            &self.organization_mappings,
            &fine.fine_type,
            fine.organization.as_deref(),
        );

        serde_json::json!({
            "Code": code,
            "Amount": 1,
            "Price": fine.amount,
            "Description": description,
        })
    }

    fn fee_row(&self, transaction_fee: i64) -> serde_json::Value {
        let code = self
            .config
            .transaction_fee_product_code
            .as_deref()
            .unwrap_or(&self.config.product_code);
        serde_json::json!({
            "Code": code,
            "Amount": 1,
            "Price": transaction_fee,
            "Description": "Palvelumaksu / Serviceavgift / Transaction fee",
        })
    }

    /// Checksum fields for the outbound request: order id, merchant, then
    /// every product's code and price, then the two callback addresses.
    fn request_checksum(
        &self,
        transaction_id: &str,
        products: &[serde_json::Value],
        return_url: &str,
        notify_url: &str,
    ) -> String {
        let mut parts: Vec<String> = vec![
            transaction_id.to_string(),
            self.config.merchant_id.clone(),
        ];
        for product in products {
            parts.push(
                product
                    .get("Code")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            );
            parts.push(
                product
                    .get("Price")
                    .and_then(|v| v.as_i64())
                    .unwrap_or_default()
                    .to_string(),
            );
        }
        parts.push(return_url.to_string());
        parts.push(notify_url.to_string());
        let part_refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        sha256_checksum(&part_refs, &self.config.secret)
    }

    fn map_callback_status(status: i64) -> CallbackOutcome {
        match status {
            STATUS_SUCCESS => CallbackOutcome::Success,
            STATUS_CANCELLED => CallbackOutcome::Cancelled,
            STATUS_ERROR => CallbackOutcome::Failed {
                reason: "gateway reported a system error".to_string(),
            },
            STATUS_INVALID_REQUEST => CallbackOutcome::Failed {
                reason: "gateway rejected the payment request".to_string(),
            },
            other => CallbackOutcome::Failed {
                reason: format!("unknown payment status {}", other),
            },
        }
    }
}

#[async_trait]
impl GatewayAdapter for CpuGateway {
    async fn start_payment(
        &self,
        request: StartPaymentRequest,
    ) -> PaymentResult<RedirectInstruction> {
        if request.fines.is_empty() {
            return Err(PaymentError::ValidationError {
                message: "at least one fine is required".to_string(),
                field: Some("fines".to_string()),
            });
        }

        let mut products: Vec<serde_json::Value> =
            request.fines.iter().map(|f| self.product_row(f)).collect();
        if request.transaction_fee > 0 {
            products.push(self.fee_row(request.transaction_fee));
        }

        let (firstname, lastname) = split_payer_name(
            request.payer.firstname.as_deref(),
            request.payer.lastname.as_deref(),
        );
        let language = request
            .payer
            .language
            .as_deref()
            .and_then(|lang| self.language_mappings.get(lang))
            .cloned();

        let hash = self.request_checksum(
            &request.transaction_id,
            &products,
            &request.return_url,
            &request.notify_url,
        );

        let payload = serde_json::json!({
            "ApiVersion": "3.0",
            "Source": self.config.merchant_id,
            "Id": request.transaction_id,
            "Description": self.config.payment_description,
            "Products": products,
            "Email": request.payer.email,
            "FirstName": firstname,
            "LastName": lastname,
            "Language": language,
            "Currency": request.currency,
            "ReturnAddress": request.return_url,
            "NotificationAddress": request.notify_url,
            "Hash": hash,
        });

        let response: CpuStartResponse = self
            .http
            .post_json(&self.config.url, &payload, &[])
            .await?;

        if response.id.is_empty() {
            return Err(PaymentError::GatewayError {
                gateway: "cpu".to_string(),
                message: "empty response to payment start".to_string(),
                provider_code: None,
                retryable: false,
            });
        }

        // The response is authenticated before its status is believed.
        let status_string = response.status.to_string();
        let hash_parts = [
            request.transaction_id.as_str(),
            status_string.as_str(),
            response.reference.as_str(),
            response.payment_address.as_str(),
        ];
        if !verify_sha256_checksum(&hash_parts, &self.config.secret, &response.hash) {
            return Err(PaymentError::SignatureError {
                message: "invalid checksum on payment start response".to_string(),
            });
        }

        match response.status {
            STATUS_PENDING => {
                info!(
                    transaction_id = %request.transaction_id,
                    reference = %response.reference,
                    "cpu payment started"
                );
                Ok(RedirectInstruction {
                    url: response.payment_address,
                    provider_reference: Some(response.reference),
                })
            }
            STATUS_SUCCESS => Err(PaymentError::GatewayError {
                gateway: "cpu".to_string(),
                message: "transaction already processed".to_string(),
                provider_code: Some(response.status.to_string()),
                retryable: false,
            }),
            STATUS_ID_EXISTS => Err(PaymentError::GatewayError {
                gateway: "cpu".to_string(),
                message: "order id already exists".to_string(),
                provider_code: Some(response.status.to_string()),
                retryable: false,
            }),
            STATUS_CANCELLED => Err(PaymentError::GatewayError {
                gateway: "cpu".to_string(),
                message: "order was cancelled".to_string(),
                provider_code: Some(response.status.to_string()),
                retryable: false,
            }),
            other => Err(PaymentError::GatewayError {
                gateway: "cpu".to_string(),
                message: format!("error starting payment, status {}", other),
                provider_code: Some(other.to_string()),
                retryable: other == STATUS_ERROR,
            }),
        }
    }

    fn validate_callback(&self, request: &CallbackRequest) -> PaymentResult<ValidatedCallback> {
        let mut fields = HashMap::new();
        for name in ["Id", "Status", "Reference", "Hash"] {
            let value = request.field(name).ok_or_else(|| {
                warn!(parameter = name, "missing parameter in payment callback");
                PaymentError::MissingCallbackParameter {
                    name: name.to_string(),
                }
            })?;
            fields.insert(name, value);
        }

        let status: i64 =
            fields["Status"]
                .trim()
                .parse()
                .map_err(|_| PaymentError::ValidationError {
                    message: format!("invalid status value '{}'", fields["Status"]),
                    field: Some("Status".to_string()),
                })?;

        // Checksum covers the normalized status integer, not the raw string.
        let status_string = status.to_string();
        let hash_parts = [
            fields["Id"].as_str(),
            status_string.as_str(),
            fields["Reference"].as_str(),
        ];
        if !verify_sha256_checksum(&hash_parts, &self.config.secret, &fields["Hash"]) {
            return Err(PaymentError::SignatureError {
                message: "invalid checksum on payment callback".to_string(),
            });
        }

        Ok(ValidatedCallback {
            outcome: Self::map_callback_status(status),
            transaction_id: fields["Id"].clone(),
            provider_reference: fields["Reference"].clone(),
        })
    }

    fn name(&self) -> GatewayName {
        GatewayName::Cpu
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["EUR"]
    }
}

/// The gateway wants both name fields. When only a combined name is known,
/// split "Lastname, Firstname" or "First Middle Last"; fall back to a
/// placeholder because empty names are rejected.
fn split_payer_name(firstname: Option<&str>, lastname: Option<&str>) -> (String, String) {
    const PLACEHOLDER: &str = "ei tietoa";

    let firstname = firstname.map(str::trim).filter(|s| !s.is_empty());
    let lastname = lastname.map(str::trim).filter(|s| !s.is_empty());

    match (firstname, lastname) {
        (Some(first), Some(last)) => (first.to_string(), last.to_string()),
        (Some(first), None) => (first.to_string(), PLACEHOLDER.to_string()),
        (None, Some(combined)) => {
            if let Some((last, first)) = combined.split_once(',') {
                let first = first.trim();
                let last = last.trim();
                (
                    if first.is_empty() {
                        PLACEHOLDER.to_string()
                    } else {
                        first.to_string()
                    },
                    last.to_string(),
                )
            } else if let Some((first, last)) = combined.rsplit_once(' ') {
                (first.trim().to_string(), last.trim().to_string())
            } else {
                (PLACEHOLDER.to_string(), combined.to_string())
            }
        }
        (None, None) => (PLACEHOLDER.to_string(), PLACEHOLDER.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct CpuStartResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Status")]
    status: i64,
    #[serde(rename = "Reference", default)]
    reference: String,
    #[serde(rename = "PaymentAddress", default)]
    payment_address: String,
    #[serde(rename = "Hash", default)]
    hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::utils::sha256_checksum;

    fn gateway() -> CpuGateway {
        CpuGateway::new(CpuConfig {
            merchant_id: "MERCHANT".to_string(),
            secret: "s3cret".to_string(),
            url: "https://payments.example.com/api".to_string(),
            product_code: "LIBFINE".to_string(),
            transaction_fee_product_code: Some("LIBFEE".to_string()),
            payment_description: None,
            product_code_mappings: "overdue=OD".to_string(),
            organization_product_code_mappings: "helmet=HM".to_string(),
            supported_languages: "fi=1:sv=2:en=3".to_string(),
            timeout_secs: 5,
            max_retries: 1,
        })
        .expect("gateway init should succeed")
    }

    fn valid_callback(status: &str) -> CallbackRequest {
        let hash = sha256_checksum(&["txn_1", status, "ref_1"], "s3cret");
        let mut params = HashMap::new();
        params.insert("Id".to_string(), "txn_1".to_string());
        params.insert("Status".to_string(), status.to_string());
        params.insert("Reference".to_string(), "ref_1".to_string());
        params.insert("Hash".to_string(), hash);
        CallbackRequest::from_params(params)
    }

    #[test]
    fn missing_configuration_is_fatal() {
        let result = CpuGateway::new(CpuConfig {
            merchant_id: "".to_string(),
            secret: "s".to_string(),
            url: "u".to_string(),
            product_code: "P".to_string(),
            transaction_fee_product_code: None,
            payment_description: None,
            product_code_mappings: String::new(),
            organization_product_code_mappings: String::new(),
            supported_languages: String::new(),
            timeout_secs: 5,
            max_retries: 1,
        });
        assert!(matches!(
            result.err(),
            Some(PaymentError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn valid_success_callback_is_accepted() {
        let validated = gateway()
            .validate_callback(&valid_callback("1"))
            .expect("validation should succeed");
        assert_eq!(validated.outcome, CallbackOutcome::Success);
        assert_eq!(validated.transaction_id, "txn_1");
        assert_eq!(validated.provider_reference, "ref_1");
    }

    #[test]
    fn cancelled_callback_maps_to_cancelled() {
        let validated = gateway()
            .validate_callback(&valid_callback("0"))
            .expect("validation should succeed");
        assert_eq!(validated.outcome, CallbackOutcome::Cancelled);
    }

    #[test]
    fn tampered_status_is_rejected() {
        // Signature computed for a cancelled callback, status flipped to
        // success afterwards.
        let mut callback = valid_callback("0");
        callback
            .params
            .insert("Status".to_string(), "1".to_string());
        let err = gateway()
            .validate_callback(&callback)
            .expect_err("tampered callback must be rejected");
        assert!(matches!(err, PaymentError::SignatureError { .. }));
        assert!(err.is_callback_rejection());
    }

    #[test]
    fn missing_hash_is_rejected() {
        let mut callback = valid_callback("1");
        callback.params.remove("Hash");
        let err = gateway()
            .validate_callback(&callback)
            .expect_err("callback without hash must be rejected");
        assert!(matches!(
            err,
            PaymentError::MissingCallbackParameter { .. }
        ));
    }

    #[test]
    fn error_statuses_map_to_failed_outcome() {
        let validated = gateway()
            .validate_callback(&valid_callback("98"))
            .expect("validation should succeed");
        assert!(matches!(validated.outcome, CallbackOutcome::Failed { .. }));
    }

    #[test]
    fn product_row_maps_codes_and_sanitizes_description() {
        let gateway = gateway();
        let row = gateway.product_row(&FineSnapshot {
            fine_reference: "fine_1".to_string(),
            fine_type: "overdue".to_string(),
            title: Some("Tuntematon sotilas – erikoispainos".to_string()),
            organization: Some("helmet".to_string()),
            amount: 250,
        });
        assert_eq!(row["Code"], "HMOD");
        assert_eq!(row["Price"], 250);
        let description = row["Description"].as_str().expect("description present");
        assert!(description.starts_with("overdue ("));
        assert!(description.len() <= crate::payments::utils::MAX_DESCRIPTION_LEN);
    }

    #[test]
    fn payer_name_splitting_covers_known_shapes() {
        assert_eq!(
            split_payer_name(Some("Aino"), Some("Virtanen")),
            ("Aino".to_string(), "Virtanen".to_string())
        );
        assert_eq!(
            split_payer_name(None, Some("Virtanen, Aino")),
            ("Aino".to_string(), "Virtanen".to_string())
        );
        assert_eq!(
            split_payer_name(None, Some("Aino Maria Virtanen")),
            ("Aino Maria".to_string(), "Virtanen".to_string())
        );
        assert_eq!(
            split_payer_name(None, Some("Virtanen")),
            ("ei tietoa".to_string(), "Virtanen".to_string())
        );
        assert_eq!(
            split_payer_name(None, None),
            ("ei tietoa".to_string(), "ei tietoa".to_string())
        );
    }
}
