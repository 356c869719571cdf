pub mod store;

pub use store::{MergedPool, PoolStore, Section, DEFAULT_MODE};
