use crate::payments::error::{PaymentError, PaymentResult};
use regex::Regex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

/// Maximum length the reference gateway accepts for a product description.
pub const MAX_DESCRIPTION_LEN: usize = 100;

/// Maximum length the reference gateway accepts for a product code.
pub const MAX_PRODUCT_CODE_LEN: usize = 25;

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    timeout: Duration,
    max_retries: u32,
}

impl PaymentHttpClient {
    pub fn new(timeout: Duration, max_retries: u32) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            timeout,
            max_retries,
        })
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &JsonValue,
        additional_headers: &[(&str, &str)],
    ) -> PaymentResult<T> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            let mut request = self
                .client
                .post(url)
                .timeout(self.timeout)
                .header("Content-Type", "application/json")
                .json(body);
            for (k, v) in additional_headers {
                request = request.header(*k, *v);
            }

            let response = request
                .send()
                .await
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("gateway request failed: {}", e),
                });

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            PaymentError::GatewayError {
                                gateway: "http".to_string(),
                                message: format!("invalid gateway JSON response: {}", e),
                                provider_code: None,
                                retryable: false,
                            }
                        });
                    }

                    if status.as_u16() == 429 {
                        if attempt < self.max_retries {
                            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                            continue;
                        }
                        return Err(PaymentError::RateLimitError {
                            message: "gateway rate limit exceeded".to_string(),
                            retry_after_seconds: None,
                        });
                    }

                    if status.is_server_error() && attempt < self.max_retries {
                        warn!(
                            status = %status,
                            attempt = attempt + 1,
                            "gateway server error, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }

                    return Err(PaymentError::GatewayError {
                        gateway: "http".to_string(),
                        message: format!("HTTP {}: {}", status, text),
                        provider_code: Some(status.as_u16().to_string()),
                        retryable: status.is_server_error(),
                    });
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(PaymentError::NetworkError {
            message: "gateway request failed".to_string(),
        }))
    }
}

/// SHA-256 checksum over `&`-joined fields with the shared secret appended,
/// hex-encoded. This is the signature scheme of the reference gateway for
/// both outbound requests and inbound callbacks.
pub fn sha256_checksum(parts: &[&str], secret: &str) -> String {
    let mut joined = parts.join("&");
    joined.push('&');
    joined.push_str(secret);

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a checksum in constant time.
pub fn verify_sha256_checksum(parts: &[&str], secret: &str, received: &str) -> bool {
    let expected = sha256_checksum(parts, secret);
    secure_eq(expected.as_bytes(), received.trim().as_bytes())
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Sanitize a product description for the gateway: the reference gateway
/// only accepts Latin-1 text, chokes on apostrophes, and caps the length at
/// 100 characters.
pub fn sanitize_description(input: &str) -> String {
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    let whitespace =
        WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

    let latin1: String = input
        .chars()
        .map(|c| if (c as u32) <= 0xFF && c != '\'' { c } else { ' ' })
        .collect();
    let collapsed = whitespace.replace_all(latin1.trim(), " ").to_string();
    collapsed.chars().take(MAX_DESCRIPTION_LEN).collect()
}

/// Parse `key=value:key=value` mapping strings from configuration.
pub fn parse_code_mappings(raw: &str) -> HashMap<String, String> {
    let mut mappings = HashMap::new();
    for item in raw.split(':') {
        let mut parts = item.splitn(2, '=');
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if !key.is_empty() && !value.is_empty() {
            mappings.insert(key.to_string(), value.to_string());
        }
    }
    mappings
}

/// Resolve the product code for a fine. An organization mapping takes
/// precedence and is prefixed to the fine-type mapping; the result is capped
/// at the gateway's 25-character limit.
pub fn resolve_product_code(
    default_code: &str,
    type_mappings: &HashMap<String, String>,
    organization_mappings: &HashMap<String, String>,
    fine_type: &str,
    organization: Option<&str>,
) -> String {
    let code = match organization.and_then(|org| organization_mappings.get(org)) {
        Some(org_code) => format!(
            "{}{}",
            org_code,
            type_mappings
                .get(fine_type)
                .map(String::as_str)
                .unwrap_or("")
        ),
        None => type_mappings
            .get(fine_type)
            .cloned()
            .unwrap_or_else(|| default_code.to_string()),
    };
    code.chars().take(MAX_PRODUCT_CODE_LEN).collect()
}

/// Append a query parameter to a URL that may or may not already carry one.
pub fn add_query_param(url: &str, name: &str, value: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}={}", url, separator, name, percent_encode(value))
}

fn percent_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_eq_behaves_correctly() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"ab"));
    }

    #[test]
    fn checksum_matches_known_construction() {
        // sha256("a&b&c&secret")
        let expected = {
            let mut hasher = Sha256::new();
            hasher.update(b"a&b&c&secret");
            hex::encode(hasher.finalize())
        };
        assert_eq!(sha256_checksum(&["a", "b", "c"], "secret"), expected);
        assert!(verify_sha256_checksum(&["a", "b", "c"], "secret", &expected));
    }

    #[test]
    fn checksum_verification_rejects_tampering() {
        let valid = sha256_checksum(&["id_1", "1", "ref_1"], "secret");
        assert!(!verify_sha256_checksum(
            &["id_1", "0", "ref_1"],
            "secret",
            &valid
        ));
        assert!(!verify_sha256_checksum(
            &["id_1", "1", "ref_1"],
            "other",
            &valid
        ));
    }

    #[test]
    fn description_is_sanitized_and_capped() {
        let sanitized = sanitize_description("Overdue  fine  (Tule ei sammu – 火)");
        assert!(!sanitized.contains('\u{706b}'));
        assert!(!sanitized.contains("  "));

        let long = "x".repeat(250);
        assert_eq!(sanitize_description(&long).len(), MAX_DESCRIPTION_LEN);
    }

    #[test]
    fn description_drops_apostrophes() {
        assert_eq!(sanitize_description("it's fine"), "it s fine");
    }

    #[test]
    fn code_mappings_parse_config_format() {
        let mappings = parse_code_mappings("overdue=100:lost=200 : bad");
        assert_eq!(mappings.get("overdue").map(String::as_str), Some("100"));
        assert_eq!(mappings.get("lost").map(String::as_str), Some("200"));
        assert_eq!(mappings.len(), 2);
    }

    #[test]
    fn product_code_resolution_prefers_organization() {
        let types = parse_code_mappings("overdue=01");
        let orgs = parse_code_mappings("helmet=HM");
        assert_eq!(
            resolve_product_code("DEF", &types, &orgs, "overdue", Some("helmet")),
            "HM01"
        );
        assert_eq!(
            resolve_product_code("DEF", &types, &orgs, "overdue", None),
            "01"
        );
        assert_eq!(
            resolve_product_code("DEF", &types, &orgs, "unknown", None),
            "DEF"
        );
    }

    #[test]
    fn product_code_is_capped() {
        let code = resolve_product_code(
            &"Z".repeat(40),
            &HashMap::new(),
            &HashMap::new(),
            "any",
            None,
        );
        assert_eq!(code.len(), MAX_PRODUCT_CODE_LEN);
    }

    #[test]
    fn query_params_are_appended() {
        assert_eq!(
            add_query_param("https://x.test/fines", "payment_id", "abc"),
            "https://x.test/fines?payment_id=abc"
        );
        assert_eq!(
            add_query_param("https://x.test/fines?lang=fi", "payment_id", "a b"),
            "https://x.test/fines?lang=fi&payment_id=a%20b"
        );
    }
}
