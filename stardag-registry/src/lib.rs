//! HTTP implementations of `stardag_core`'s registry and lock contracts
//! (§6 "External interfaces"), kept in a separate crate so the core engine
//! never depends on an HTTP client.

pub mod client;
pub mod lock;
pub mod wire;

pub use client::{Credential, HttpRegistry, HttpRegistryConfig};
pub use lock::{HttpLock, HttpLockConfig};
