use crate::domain::order::{Effect, Order, OrderId};
use crate::domain::payment::{Payment, PaymentId, PaymentStatus};
use crate::domain::ports::{OrderMutation, OrderStore, PaymentMutation, PaymentStore};
use crate::domain::provider::Provider;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode, Options,
    Transaction, TransactionDB, TransactionDBOptions,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

/// Column Family for order records.
pub const CF_ORDERS: &str = "orders";
/// Column Family for payment records.
pub const CF_PAYMENTS: &str = "payments";
/// Unique index: `{provider}/{provider_ref}` → payment id.
pub const CF_PROVIDER_REFS: &str = "provider_refs";
/// Partial index: order id → its single active payment id.
pub const CF_ACTIVE_PAYMENTS: &str = "active_payments";
/// `{order_id}/{payment_id}` → empty, to list an order's payments.
pub const CF_ORDER_PAYMENTS: &str = "order_payments";

const COLUMN_FAMILIES: [&str; 5] = [
    CF_ORDERS,
    CF_PAYMENTS,
    CF_PROVIDER_REFS,
    CF_ACTIVE_PAYMENTS,
    CF_ORDER_PAYMENTS,
];

/// Lock wait before a contended record surfaces as `StoreUnavailable`.
const LOCK_TIMEOUT_MS: i64 = 2_000;

type Txn<'a> = Transaction<'a, TransactionDB>;

/// A persistent store implementation using RocksDB transactions.
///
/// Every read-modify-write takes row locks (`get_for_update`) on exactly the
/// keys it touches, so concurrent mutations of different orders never wait on
/// each other while mutations of the same record serialize. Lock timeouts are
/// reported as `StoreUnavailable`, which callers retry.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<TransactionDB>`).
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<TransactionDB>,
}

fn storage_error(e: rocksdb::Error) -> PaymentError {
    match e.kind() {
        ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain => {
            PaymentError::StoreUnavailable(e.to_string())
        }
        _ => PaymentError::Storage(e),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn ref_key(provider: Provider, provider_ref: &str) -> String {
    format!("{provider}/{provider_ref}")
}

fn order_payment_key(order_id: &OrderId, payment_id: &PaymentId) -> String {
    format!("{order_id}/{payment_id}")
}

impl RocksDbStore {
    /// Opens or creates a RocksDB instance at the specified path, creating the
    /// record and index column families when missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(LOCK_TIMEOUT_MS);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));

        let db = TransactionDB::open_cf_descriptors(&opts, &txn_opts, path, descriptors)
            .map_err(storage_error)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            PaymentError::StoreUnavailable(format!("{name} column family not found"))
        })
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &str) -> Result<Option<T>> {
        let cf = self.cf(cf)?;
        match self.db.get_cf(cf, key).map_err(storage_error)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_locked<T: DeserializeOwned>(&self, txn: &Txn<'_>, cf: &str, key: &str) -> Result<Option<T>> {
        let cf = self.cf(cf)?;
        match txn.get_for_update_cf(cf, key, true).map_err(storage_error)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item.map_err(storage_error)?;
            values.push(decode(&value)?);
        }
        Ok(values)
    }

    fn payment_ids_for_order(&self, order_id: &OrderId) -> Result<Vec<PaymentId>> {
        let cf = self.cf(CF_ORDER_PAYMENTS)?;
        let prefix = format!("{order_id}/");
        let mut ids = Vec::new();
        // Keys sort by order id, so the order's entries are contiguous.
        let entries = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in entries {
            let (key, _) = item.map_err(storage_error)?;
            let Some(payment_id) = key.strip_prefix(prefix.as_bytes()) else {
                break;
            };
            ids.push(String::from_utf8_lossy(payment_id).parse()?);
        }
        Ok(ids)
    }

    /// Writes `next` and maintains both indexes inside `txn`.
    fn write_payment(&self, txn: &Txn<'_>, current: Option<&Payment>, next: &Payment) -> Result<()> {
        let previous_ref = current.and_then(|p| p.provider_ref.clone());
        if next.provider_ref != previous_ref
            && let Some(provider_ref) = &next.provider_ref
        {
            let key = ref_key(next.provider, provider_ref);
            let owner: Option<PaymentId> = self.read_locked(txn, CF_PROVIDER_REFS, &key)?;
            if let Some(owner) = owner
                && owner != next.id
            {
                return Err(PaymentError::DuplicateProviderRef {
                    provider: next.provider,
                    provider_ref: provider_ref.clone(),
                });
            }
            if let Some(old) = previous_ref {
                txn.delete_cf(self.cf(CF_PROVIDER_REFS)?, ref_key(next.provider, &old))
                    .map_err(storage_error)?;
            }
            txn.put_cf(self.cf(CF_PROVIDER_REFS)?, key, encode(&next.id)?)
                .map_err(storage_error)?;
        }

        let active_key = next.order_id.to_string();
        let active: Option<PaymentId> = self.read_locked(txn, CF_ACTIVE_PAYMENTS, &active_key)?;
        if next.is_active() {
            txn.put_cf(self.cf(CF_ACTIVE_PAYMENTS)?, &active_key, encode(&next.id)?)
                .map_err(storage_error)?;
        } else if active == Some(next.id) {
            txn.delete_cf(self.cf(CF_ACTIVE_PAYMENTS)?, &active_key)
                .map_err(storage_error)?;
        }

        txn.put_cf(self.cf(CF_PAYMENTS)?, next.id.to_string(), encode(next)?)
            .map_err(storage_error)?;
        Ok(())
    }
}

#[async_trait]
impl PaymentStore for RocksDbStore {
    async fn open(&self, payment: Payment) -> Result<Payment> {
        let txn = self.db.transaction();
        let active: Option<PaymentId> =
            self.read_locked(&txn, CF_ACTIVE_PAYMENTS, &payment.order_id.to_string())?;
        if let Some(payment_id) = active {
            return Err(PaymentError::ActivePaymentExists {
                order_id: payment.order_id,
                payment_id,
            });
        }
        self.write_payment(&txn, None, &payment)?;
        txn.put_cf(
            self.cf(CF_ORDER_PAYMENTS)?,
            order_payment_key(&payment.order_id, &payment.id),
            b"",
        )
        .map_err(storage_error)?;
        txn.commit().map_err(storage_error)?;
        Ok(payment)
    }

    async fn get(&self, id: &PaymentId) -> Result<Option<Payment>> {
        self.read(CF_PAYMENTS, &id.to_string())
    }

    async fn find_by_provider_ref(
        &self,
        provider: Provider,
        provider_ref: &str,
    ) -> Result<Option<Payment>> {
        let owner: Option<PaymentId> = self.read(CF_PROVIDER_REFS, &ref_key(provider, provider_ref))?;
        match owner {
            Some(id) => self.read(CF_PAYMENTS, &id.to_string()),
            None => Ok(None),
        }
    }

    async fn for_order(&self, order_id: &OrderId) -> Result<Vec<Payment>> {
        let mut payments = Vec::new();
        for id in self.payment_ids_for_order(order_id)? {
            if let Some(payment) = self.read::<Payment>(CF_PAYMENTS, &id.to_string())? {
                payments.push(payment);
            }
        }
        payments.sort_by_key(|p| p.attempt);
        Ok(payments)
    }

    async fn with_status(&self, status: PaymentStatus) -> Result<Vec<Payment>> {
        let mut payments: Vec<Payment> = self
            .scan::<Payment>(CF_PAYMENTS)?
            .into_iter()
            .filter(|p| p.status == status)
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn all(&self) -> Result<Vec<Payment>> {
        let mut payments = self.scan::<Payment>(CF_PAYMENTS)?;
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn update(&self, id: &PaymentId, mutation: PaymentMutation) -> Result<(Payment, Effect)> {
        let txn = self.db.transaction();
        let current: Payment = self
            .read_locked(&txn, CF_PAYMENTS, &id.to_string())?
            .ok_or(PaymentError::PaymentNotFound(*id))?;
        let mut next = current.clone();
        let effect = mutation(&mut next)?;
        if effect == Effect::Unchanged {
            return Ok((current, effect));
        }
        if next.id != current.id
            || next.order_id != current.order_id
            || next.provider != current.provider
            || next.attempt != current.attempt
        {
            return Err(PaymentError::Validation(format!(
                "Identity fields of payment {id} are immutable"
            )));
        }
        self.write_payment(&txn, Some(&current), &next)?;
        txn.commit().map_err(storage_error)?;
        Ok((next, effect))
    }
}

#[async_trait]
impl OrderStore for RocksDbStore {
    async fn insert(&self, order: Order) -> Result<()> {
        let txn = self.db.transaction();
        let key = order.id.to_string();
        if self.read_locked::<Order>(&txn, CF_ORDERS, &key)?.is_some() {
            return Err(PaymentError::Validation(format!(
                "Order {} already exists",
                order.id
            )));
        }
        txn.put_cf(self.cf(CF_ORDERS)?, key, encode(&order)?)
            .map_err(storage_error)?;
        txn.commit().map_err(storage_error)?;
        Ok(())
    }

    async fn get(&self, id: &OrderId) -> Result<Option<Order>> {
        self.read(CF_ORDERS, &id.to_string())
    }

    async fn update(&self, id: &OrderId, mutation: OrderMutation) -> Result<(Order, Effect)> {
        let txn = self.db.transaction();
        let mut order: Order = self
            .read_locked(&txn, CF_ORDERS, &id.to_string())?
            .ok_or(PaymentError::OrderNotFound(*id))?;

        // Lock the payments too so the mutation's preconditions hold at commit.
        let mut payments = Vec::new();
        for payment_id in self.payment_ids_for_order(id)? {
            if let Some(payment) =
                self.read_locked::<Payment>(&txn, CF_PAYMENTS, &payment_id.to_string())?
            {
                payments.push(payment);
            }
        }

        let effect = mutation(&mut order, &payments)?;
        if order.id != *id {
            return Err(PaymentError::Validation(format!(
                "Identity of order {id} is immutable"
            )));
        }
        if effect == Effect::Changed {
            txn.put_cf(self.cf(CF_ORDERS)?, id.to_string(), encode(&order)?)
                .map_err(storage_error)?;
        }
        txn.commit().map_err(storage_error)?;
        Ok((order, effect))
    }
}
