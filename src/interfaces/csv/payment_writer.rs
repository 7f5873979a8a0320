use crate::domain::payment::Payment;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct PaymentRow<'a> {
    payment: String,
    order: String,
    provider: &'a str,
    provider_ref: &'a str,
    status: &'a str,
    amount: String,
    currency: &'a str,
    refunded: u64,
    confirmed_at: String,
}

impl<'a> From<&'a Payment> for PaymentRow<'a> {
    fn from(payment: &'a Payment) -> Self {
        Self {
            payment: payment.id.to_string(),
            order: payment.order_id.to_string(),
            provider: payment.provider.as_str(),
            provider_ref: payment.provider_ref.as_deref().unwrap_or(""),
            status: payment.status.as_str(),
            amount: payment.amount.to_major(&payment.currency).to_string(),
            currency: payment.currency.code(),
            refunded: payment.refunded_amount,
            confirmed_at: payment
                .confirmed_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default(),
        }
    }
}

/// Writes the payment ledger as CSV for manual reconciliation.
///
/// Amounts are in major units; `refunded` is in minor units.
pub struct PaymentWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> PaymentWriter<W> {
    pub fn new(destination: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(destination),
        }
    }

    pub fn write_payments<'a>(&mut self, payments: impl IntoIterator<Item = &'a Payment>) -> Result<()> {
        let mut empty = true;
        for payment in payments {
            self.writer.serialize(PaymentRow::from(payment))?;
            empty = false;
        }
        // The header comes from the first serialized row; an empty ledger
        // still gets one.
        if empty {
            self.writer.write_record([
                "payment",
                "order",
                "provider",
                "provider_ref",
                "status",
                "amount",
                "currency",
                "refunded",
                "confirmed_at",
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::{Amount, Currency};
    use crate::domain::order::OrderId;
    use crate::domain::payment::PaymentStatus;
    use crate::domain::provider::Provider;

    #[test]
    fn test_writes_ledger_rows() {
        let mut payment = Payment::new(
            OrderId::new(),
            1,
            Provider::CardWallet,
            Amount::new(1050).unwrap(),
            Currency::new("USD").unwrap(),
        );
        payment.attach_provider_ref("CW-77").unwrap();
        payment.transition(PaymentStatus::Completed, None).unwrap();

        let mut out = Vec::new();
        PaymentWriter::new(&mut out).write_payments([&payment]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();

        assert_eq!(
            lines.next().unwrap(),
            "payment,order,provider,provider_ref,status,amount,currency,refunded,confirmed_at"
        );
        let row = lines.next().unwrap();
        assert!(row.contains(",card_wallet,CW-77,completed,10.50,USD,0,"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_empty_ledger_has_header() {
        let mut out = Vec::new();
        PaymentWriter::new(&mut out).write_payments([]).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("payment,order,provider"));
    }
}
