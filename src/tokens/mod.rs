mod cache;
mod dispatch;
pub mod record;
pub mod store;

pub use dispatch::InvalidationCallback;
pub use record::{redact, PortRange, TokenError, TokenRecord};
pub use store::{StoreError, StoreOptions, TokenStore};
