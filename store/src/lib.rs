//! Abstract storage traits for the palisade proxy.
//!
//! Every storage backend (Postgres, in-memory for testing) implements
//! these traits. The rest of the codebase depends only on the traits.

pub mod capabilities;
pub mod error;
pub mod memory;
pub mod traits;

pub use capabilities::StoreCapabilities;
pub use error::StoreError;
pub use memory::MemoryCounterStore;
pub use traits::{CounterStore, DailyCount, WindowCount};
