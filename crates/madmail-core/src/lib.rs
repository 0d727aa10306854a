pub mod api;
pub mod endpoint;
pub mod error;
pub mod profiles;
pub mod store;

#[cfg(feature = "client")]
pub mod cache;
#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
pub mod version;

pub use error::{AdminError, CoordinatorError, FetchError, StoreError};
