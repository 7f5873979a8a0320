//! Application layer: the payment ledger, the order state machine and the
//! reconciliation service that ties them to the providers.
//!
//! Correctness under concurrent handlers rests on the stores' atomic
//! record-level updates, not on serializing requests here.

pub mod ledger;
pub mod order_state_machine;
pub mod reconciliation;
pub mod retry;

pub use ledger::{PaymentLedger, TransitionOutcome};
pub use order_state_machine::OrderStateMachine;
pub use reconciliation::{
    CheckoutSession, ProviderRegistry, ReconciliationService, RefundOutcome, SweepReport,
};
