//! Top-level error type aggregating the crate's typed errors for callers
//! (e.g. `xtask`) that want a single `Result` alias rather than matching
//! on each subsystem's own error type.

use crate::build::scheduler::BuildError;
use crate::build::graph::DiscoveryError;
use crate::polymorphic::PolymorphicError;
use crate::run::TaskError;

#[derive(thiserror::Error, Debug)]
pub enum StardagError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Polymorphic(#[from] PolymorphicError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StardagError>;
