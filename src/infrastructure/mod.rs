pub mod in_memory;
pub mod notifier;
pub mod providers;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
