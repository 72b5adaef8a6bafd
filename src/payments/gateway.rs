use crate::payments::error::PaymentResult;
use crate::payments::types::{
    CallbackRequest, GatewayName, RedirectInstruction, StartPaymentRequest, ValidatedCallback,
};
use async_trait::async_trait;

/// One implementation per external payment provider.
///
/// `start_payment` must not touch the transaction store: the orchestrator
/// only persists a transaction after the gateway has accepted the request,
/// so a rejected start leaves no trace. `validate_callback` must verify the
/// signature before trusting any other field of the callback.
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    async fn start_payment(
        &self,
        request: StartPaymentRequest,
    ) -> PaymentResult<RedirectInstruction>;

    fn validate_callback(&self, request: &CallbackRequest) -> PaymentResult<ValidatedCallback>;

    fn name(&self) -> GatewayName;

    fn supported_currencies(&self) -> &'static [&'static str];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{CallbackOutcome, FineSnapshot, PayerInfo};
    use std::collections::HashMap;

    struct MockGateway;

    #[async_trait]
    impl GatewayAdapter for MockGateway {
        async fn start_payment(
            &self,
            request: StartPaymentRequest,
        ) -> PaymentResult<RedirectInstruction> {
            Ok(RedirectInstruction {
                url: format!("https://pay.example.com/{}", request.transaction_id),
                provider_reference: Some("mock_ref".to_string()),
            })
        }

        fn validate_callback(
            &self,
            request: &CallbackRequest,
        ) -> PaymentResult<ValidatedCallback> {
            Ok(ValidatedCallback {
                outcome: CallbackOutcome::Success,
                transaction_id: request.field("Id").unwrap_or_default(),
                provider_reference: request.field("Reference").unwrap_or_default(),
            })
        }

        fn name(&self) -> GatewayName {
            GatewayName::Cpu
        }

        fn supported_currencies(&self) -> &'static [&'static str] {
            &["EUR"]
        }
    }

    #[tokio::test]
    async fn trait_can_be_implemented_by_mock_gateway() {
        let gateway: Box<dyn GatewayAdapter> = Box::new(MockGateway);
        let redirect = gateway
            .start_payment(StartPaymentRequest {
                transaction_id: "txn_1".to_string(),
                return_url: "https://x.test/fines?payment_id=txn_1".to_string(),
                notify_url: "https://x.test/notify?payment_id=txn_1".to_string(),
                payer: PayerInfo {
                    email: Some("patron@example.com".to_string()),
                    firstname: Some("Aino".to_string()),
                    lastname: Some("Virtanen".to_string()),
                    language: Some("fi".to_string()),
                },
                fines: vec![FineSnapshot {
                    fine_reference: "fine_1".to_string(),
                    fine_type: "overdue".to_string(),
                    title: None,
                    organization: None,
                    amount: 550,
                }],
                transaction_fee: 50,
                currency: "EUR".to_string(),
            })
            .await
            .expect("start should succeed");
        assert!(redirect.url.contains("txn_1"));

        let mut params = HashMap::new();
        params.insert("Id".to_string(), "txn_1".to_string());
        params.insert("Reference".to_string(), "ref_1".to_string());
        let validated = gateway
            .validate_callback(&CallbackRequest::from_params(params))
            .expect("validation should succeed");
        assert_eq!(validated.outcome, CallbackOutcome::Success);
        assert_eq!(validated.transaction_id, "txn_1");
    }
}
