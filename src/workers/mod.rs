pub mod registration_reconciler;
