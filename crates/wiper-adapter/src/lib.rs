pub mod adapter;
pub mod runtime;

pub use adapter::{Adapter, AdapterConfig, AdapterError, AdapterState};
