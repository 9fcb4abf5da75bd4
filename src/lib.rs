//! Embedded goal store
//! Persists per-device numeric goals in an in-memory SQLite database whose
//! complete image is written to a durable key-value slot after every mutation

pub mod error;
pub mod slot;
mod snapshot;
pub mod store;

pub use error::StoreError;
pub use slot::{DurableSlot, MemorySlot, SledSlot};
pub use store::{
    activation_default, GoalValue, MetaRecord, MetaStore, DEFAULT_ACTIVATION_GOAL,
    DEFAULT_DAILY_ACTIVATION_GOAL, DEFAULT_VALUE_GOAL,
};
