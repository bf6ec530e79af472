//! Session registry and its idle-eviction task.

pub mod cleanup;
pub mod store;
