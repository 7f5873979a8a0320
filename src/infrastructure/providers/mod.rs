pub mod card_wallet;
pub(crate) mod http;
pub mod mobile_money;
pub mod signature;
pub mod token;

pub use card_wallet::CardWalletClient;
pub use mobile_money::MobileMoneyClient;
