//! Shared fixtures: an in-memory store, a scripted ILS, and a gateway mock
//! that signs and verifies callbacks with the real checksum scheme.

use async_trait::async_trait;
use patronpay_backend::database::memory::InMemoryTransactionStore;
use patronpay_backend::ils::{Fine, IlsConnector, IlsResult, PatronAccount, PayableCheck};
use patronpay_backend::payments::error::{PaymentError, PaymentResult};
use patronpay_backend::payments::gateway::GatewayAdapter;
use patronpay_backend::payments::types::{
    CallbackOutcome, CallbackRequest, GatewayName, RedirectInstruction, StartPaymentRequest,
    ValidatedCallback,
};
use patronpay_backend::payments::utils::{sha256_checksum, verify_sha256_checksum};
use patronpay_backend::services::orchestrator::{
    OrchestratorConfig, PaymentOrchestrator, TRANSACTION_ID_PARAM,
};
use patronpay_backend::services::payment_guard::PaymentGuard;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const TEST_SECRET: &str = "test_secret";

/// Gateway test double. Start always succeeds (unless told to fail);
/// callback validation uses the production checksum helpers, so signature
/// properties are exercised for real.
pub struct MockGateway {
    pub fail_start: AtomicBool,
    pub start_calls: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            fail_start: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl GatewayAdapter for MockGateway {
    async fn start_payment(
        &self,
        request: StartPaymentRequest,
    ) -> PaymentResult<RedirectInstruction> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(PaymentError::GatewayError {
                gateway: "cpu".to_string(),
                message: "gateway rejected the request".to_string(),
                provider_code: Some("99".to_string()),
                retryable: false,
            });
        }
        Ok(RedirectInstruction {
            url: format!("https://pay.test/{}", request.transaction_id),
            provider_reference: Some(format!("ref_{}", request.transaction_id)),
        })
    }

    fn validate_callback(&self, request: &CallbackRequest) -> PaymentResult<ValidatedCallback> {
        let mut fields = HashMap::new();
        for name in ["Id", "Status", "Reference", "Hash"] {
            let value =
                request
                    .field(name)
                    .ok_or_else(|| PaymentError::MissingCallbackParameter {
                        name: name.to_string(),
                    })?;
            fields.insert(name, value);
        }
        let status: i64 = fields["Status"]
            .parse()
            .map_err(|_| PaymentError::ValidationError {
                message: "invalid status".to_string(),
                field: Some("Status".to_string()),
            })?;
        let status_string = status.to_string();
        let parts = [
            fields["Id"].as_str(),
            status_string.as_str(),
            fields["Reference"].as_str(),
        ];
        if !verify_sha256_checksum(&parts, TEST_SECRET, &fields["Hash"]) {
            return Err(PaymentError::SignatureError {
                message: "invalid checksum".to_string(),
            });
        }
        Ok(ValidatedCallback {
            outcome: match status {
                1 => CallbackOutcome::Success,
                0 => CallbackOutcome::Cancelled,
                other => CallbackOutcome::Failed {
                    reason: format!("status {}", other),
                },
            },
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

/// ILS test double with scriptable payable fines and registration outcome.
pub struct ScriptedIls {
    payable: Mutex<PayableCheck>,
    register_ok: AtomicBool,
    pub register_calls: AtomicUsize,
}

impl ScriptedIls {
    pub fn new(amount: i64) -> Self {
        Self {
            payable: Mutex::new(payable_check(amount)),
            register_ok: AtomicBool::new(true),
            register_calls: AtomicUsize::new(0),
        }
    }

    pub async fn set_payable_amount(&self, amount: i64) {
        *self.payable.lock().await = payable_check(amount);
    }

    pub fn set_register_ok(&self, ok: bool) {
        self.register_ok.store(ok, Ordering::SeqCst);
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IlsConnector for ScriptedIls {
    async fn get_payable_fines(
        &self,
        _patron: &PatronAccount,
        _selected_fine_ids: &[String],
    ) -> IlsResult<PayableCheck> {
        Ok(self.payable.lock().await.clone())
    }

    async fn mark_fees_as_paid(
        &self,
        _patron: &PatronAccount,
        _amount: i64,
        _transaction_id: &str,
        _transaction_number: i64,
        _fine_ids: &[String],
    ) -> IlsResult<bool> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.register_ok.load(Ordering::SeqCst))
    }
}

pub fn patron() -> PatronAccount {
    PatronAccount {
        driver: "helmet".to_string(),
        patron_id: "lib.1234".to_string(),
        user_id: "42".to_string(),
        email: Some("patron@example.com".to_string()),
        firstname: Some("Aino".to_string()),
        lastname: Some("Virtanen".to_string()),
        language: Some("fi".to_string()),
    }
}

pub fn payable_check(amount: i64) -> PayableCheck {
    let fines = if amount > 0 {
        vec![Fine {
            fine_reference: "fine_1".to_string(),
            fine_type: "overdue".to_string(),
            title: Some("Seven Brothers".to_string()),
            organization: None,
            balance: amount,
            currency: "EUR".to_string(),
            payable_online: true,
        }]
    } else {
        vec![]
    };
    PayableCheck {
        payable: amount > 0,
        amount,
        fines,
        reason: None,
    }
}

pub struct Harness {
    pub store: Arc<InMemoryTransactionStore>,
    pub ils: Arc<ScriptedIls>,
    pub gateway: Arc<MockGateway>,
    pub orchestrator: PaymentOrchestrator,
}

pub fn harness(amount: i64, transaction_fee: i64) -> Harness {
    let store = Arc::new(InMemoryTransactionStore::new());
    let ils = Arc::new(ScriptedIls::new(amount));
    let gateway = Arc::new(MockGateway::new());
    let guard = Arc::new(PaymentGuard::new(
        Arc::clone(&store) as Arc<dyn patronpay_backend::database::store::TransactionStore>
    ));

    let orchestrator = PaymentOrchestrator::new(
        vec![Arc::clone(&gateway) as Arc<dyn GatewayAdapter>],
        HashMap::new(),
        GatewayName::Cpu,
        Arc::clone(&store) as Arc<dyn patronpay_backend::database::store::TransactionStore>,
        guard,
        Arc::clone(&ils) as Arc<dyn IlsConnector>,
        OrchestratorConfig {
            stale_after: Duration::from_secs(1800),
            transaction_fee,
            minimum_payment: 0,
            currency: "EUR".to_string(),
            return_base_url: "https://catalog.test/api/payments/callback/cpu/return".to_string(),
            notify_base_url: "https://catalog.test/api/payments/callback/cpu/notify".to_string(),
        },
    );

    Harness {
        store,
        ils,
        gateway,
        orchestrator,
    }
}

/// Build a correctly signed callback for the given transaction and status.
pub fn signed_callback(transaction_id: &str, status: i64) -> CallbackRequest {
    let status_string = status.to_string();
    let reference = format!("ref_{}", transaction_id);
    let hash = sha256_checksum(
        &[transaction_id, status_string.as_str(), reference.as_str()],
        TEST_SECRET,
    );

    let mut params = HashMap::new();
    params.insert(TRANSACTION_ID_PARAM.to_string(), transaction_id.to_string());
    params.insert("Id".to_string(), transaction_id.to_string());
    params.insert("Status".to_string(), status_string);
    params.insert("Reference".to_string(), reference);
    params.insert("Hash".to_string(), hash);
    CallbackRequest::from_params(params)
}

/// Extract the transaction id the orchestrator generated from the redirect.
pub fn transaction_id_from_redirect(redirect: &RedirectInstruction) -> String {
    redirect
        .url
        .rsplit('/')
        .next()
        .expect("redirect url has a path")
        .to_string()
}
