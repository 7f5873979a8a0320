mod common;

use common::Harness;
use payrecon::domain::money::{Amount, Currency};
use payrecon::domain::order::{OrderId, OrderStatus};
use payrecon::domain::outcome::Outcome;
use payrecon::domain::payment::{Payment, PaymentStatus};
use payrecon::domain::provider::Provider;
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn payment_status() -> impl Strategy<Value = PaymentStatus> {
    prop_oneof![
        Just(PaymentStatus::Pending),
        Just(PaymentStatus::Completed),
        Just(PaymentStatus::Failed),
        Just(PaymentStatus::Refunded),
    ]
}

fn card_wallet_status() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("COMPLETED"),
        Just("DECLINED"),
        Just("VOIDED"),
        Just("REFUNDED"),
        Just("APPROVED"),
        Just("PENDING"),
        Just("SOMETHING_NEW"),
    ]
}

fn expected_order_status(payment: PaymentStatus) -> OrderStatus {
    match payment {
        PaymentStatus::Pending => OrderStatus::Pending,
        PaymentStatus::Completed => OrderStatus::Paid,
        PaymentStatus::Failed => OrderStatus::Cancelled,
        PaymentStatus::Refunded => OrderStatus::Refunded,
    }
}

proptest! {
    #[test]
    fn payment_never_crosses_between_completed_and_failed(
        targets in proptest::collection::vec(payment_status(), 1..16)
    ) {
        let mut payment = Payment::new(
            OrderId::new(),
            1,
            Provider::CardWallet,
            Amount::new(1000).unwrap(),
            Currency::new("USD").unwrap(),
        );
        for target in targets {
            let before = payment.status;
            let result = payment.transition(target, None);
            prop_assert_eq!(result.is_ok(), before.can_transition_to(target));
            if result.is_err() {
                prop_assert_eq!(payment.status, before);
            }
            prop_assert!(!(before == PaymentStatus::Completed && payment.status == PaymentStatus::Failed));
            prop_assert!(!(before == PaymentStatus::Failed && payment.status == PaymentStatus::Completed));
        }
    }

    #[test]
    fn duplicate_deliveries_converge_on_single_delivery(
        status in card_wallet_status(),
        copies in 1usize..6
    ) {
        let rt = runtime();
        let (once, many) = rt.block_on(async {
            let single = Harness::new(Provider::CardWallet);
            let (order, payment) = single.checkout(1000).await;
            single.deliver(payment.provider_ref.as_deref().unwrap(), status).await;
            let once = (
                single.payment_state(&payment).await.status,
                single.order_state(&order).await,
            );

            let repeated = Harness::new(Provider::CardWallet);
            let (order, payment) = repeated.checkout(1000).await;
            for _ in 0..copies {
                repeated.deliver(payment.provider_ref.as_deref().unwrap(), status).await;
            }
            let many = (
                repeated.payment_state(&payment).await.status,
                repeated.order_state(&order).await,
            );
            (once, many)
        });

        prop_assert_eq!(once.0, many.0);
        prop_assert_eq!(once.1.status, many.1.status);
        prop_assert_eq!(once.1.history.len(), many.1.history.len());
    }

    #[test]
    fn out_of_order_deliveries_keep_order_consistent(
        statuses in proptest::collection::vec(card_wallet_status(), 1..12)
    ) {
        let rt = runtime();
        let observed = rt.block_on(async {
            let h = Harness::new(Provider::CardWallet);
            let (order, payment) = h.checkout(1000).await;
            let provider_ref = payment.provider_ref.clone().unwrap();

            let mut observed = vec![PaymentStatus::Pending];
            let mut consistent = true;
            for status in statuses {
                let outcome = h.deliver(&provider_ref, status).await;
                let payment = h.payment_state(&payment).await;
                let order = h.order_state(&order).await;
                if order.status != expected_order_status(payment.status) {
                    consistent = false;
                }
                if let Outcome::Applied { payment: applied, .. } = &outcome {
                    prop_assert_eq!(applied.status, payment.status);
                }
                observed.push(payment.status);
            }
            prop_assert!(consistent);
            Ok(observed)
        })?;

        for pair in observed.windows(2) {
            let (before, after) = (pair[0], pair[1]);
            prop_assert!(before == after || before.can_transition_to(after));
        }
    }
}
