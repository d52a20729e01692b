pub mod accountant;
pub mod metrics;
pub mod store;
pub mod upstream;
pub mod usage;

pub use accountant::SessionAccountant;
pub use store::{MemoryStore, SessionStore, SqliteStore, StoreError};
pub use upstream::{Exchange, UpstreamClient};
