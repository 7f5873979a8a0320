use crate::domain::order::OrderId;
use crate::domain::payment::PaymentId;
use crate::domain::provider::Provider;
use thiserror::Error;

/// How an error must be handled by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed request or unverifiable input: reject, no mutation.
    Input,
    /// The requested change conflicts with current state.
    Conflict,
    /// Infrastructure or provider hiccup: retry with backoff.
    Transient,
    /// Needs an operator; never resolved automatically.
    Fatal,
}

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Order {0} not found")]
    OrderNotFound(OrderId),
    #[error("Payment {0} not found")]
    PaymentNotFound(PaymentId),
    #[error("Order {order_id} already has active payment {payment_id}")]
    ActivePaymentExists {
        order_id: OrderId,
        payment_id: PaymentId,
    },
    #[error("Provider reference {provider_ref} is already attached to another {provider} payment")]
    DuplicateProviderRef {
        provider: Provider,
        provider_ref: String,
    },
    #[error("Payment {payment_id} already carries provider reference {existing}")]
    ProviderRefAlreadyAttached {
        payment_id: PaymentId,
        existing: String,
    },
    #[error("Stale transition on payment {payment_id}: expected {expected}, found {actual}")]
    StaleTransition {
        payment_id: PaymentId,
        expected: String,
        actual: String,
    },
    #[error("Illegal {entity} transition {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("Order {order_id} is already settled by {settled_with:?}, refusing payment {attempted}")]
    AlreadySettled {
        order_id: OrderId,
        settled_with: Option<PaymentId>,
        attempted: PaymentId,
    },
    #[error("Payment {payment_id} already has refund #{sequence} in flight")]
    RefundInProgress { payment_id: PaymentId, sequence: u32 },
    #[error("Provider {provider} unavailable: {reason}")]
    ProviderUnavailable { provider: Provider, reason: String },
    #[error("Provider {provider} did not answer in time; outcome unknown")]
    ProviderTimeout { provider: Provider },
    #[error("Provider {provider} rejected the request: {reason}")]
    ProviderRejected { provider: Provider, reason: String },
    #[error("Provider {provider} refused the refund: {reason}")]
    RefundNotAllowed { provider: Provider, reason: String },
    #[error("Provider {0} is not configured")]
    ProviderNotConfigured(Provider),
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Notification failed: {0}")]
    Notification(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),
}

impl PaymentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PaymentError::Validation(_)
            | PaymentError::OrderNotFound(_)
            | PaymentError::PaymentNotFound(_)
            | PaymentError::ProviderNotConfigured(_) => ErrorClass::Input,
            PaymentError::ActivePaymentExists { .. }
            | PaymentError::DuplicateProviderRef { .. }
            | PaymentError::ProviderRefAlreadyAttached { .. }
            | PaymentError::StaleTransition { .. }
            | PaymentError::IllegalTransition { .. }
            | PaymentError::ProviderRejected { .. }
            | PaymentError::RefundNotAllowed { .. }
            | PaymentError::RefundInProgress { .. } => ErrorClass::Conflict,
            PaymentError::ProviderUnavailable { .. }
            | PaymentError::ProviderTimeout { .. }
            | PaymentError::StoreUnavailable(_)
            | PaymentError::Notification(_)
            | PaymentError::IoError(_) => ErrorClass::Transient,
            PaymentError::AlreadySettled { .. }
            | PaymentError::Config(_)
            | PaymentError::Serialization(_)
            | PaymentError::CsvError(_) => ErrorClass::Fatal,
            #[cfg(feature = "storage-rocksdb")]
            PaymentError::Storage(_) => ErrorClass::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Provider-agnostic kind shown to checkout callers.
    pub fn public_kind(&self) -> &'static str {
        match self {
            PaymentError::OrderNotFound(_) | PaymentError::PaymentNotFound(_) => "not_found",
            PaymentError::ProviderRejected { .. } | PaymentError::RefundNotAllowed { .. } => {
                "payment_rejected"
            }
            _ => match self.class() {
                ErrorClass::Input => "invalid_request",
                ErrorClass::Conflict => "payment_conflict",
                ErrorClass::Transient => "payment_unavailable",
                ErrorClass::Fatal => "internal_error",
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;
