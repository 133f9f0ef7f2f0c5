//! Job state machine and store.

mod store;

pub use store::JobStore;
