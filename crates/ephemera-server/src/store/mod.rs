pub mod backend;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod error;
pub mod id;
pub mod model;
pub mod sweeper;

pub use backend::{Backend, MemoryBackend};
pub use db::DurableBackend;
pub use engine::{Store, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use model::SecretRecord;
pub use sweeper::{SweepConfig, Sweeper};
