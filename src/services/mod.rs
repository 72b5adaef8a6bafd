//! Services module for the payment business logic

pub mod fingerprint;
pub mod notification;
pub mod orchestrator;
pub mod payment_guard;

// Re-export the orchestrator surface for convenience
pub use orchestrator::{
    generate_transaction_id, CallbackAck, OrchestratorConfig, PaymentOrchestrator,
    TRANSACTION_ID_PARAM,
};
pub use payment_guard::{DenialReason, PaymentGuard, PermitDecision};
