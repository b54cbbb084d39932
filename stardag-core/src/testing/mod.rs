//! In-memory fixtures used by this crate's own tests and by `xtask`'s
//! demo scenarios. Not part of the public contract; kept in-tree (rather
//! than under `tests/`) so `identity` and `build::graph`'s unit tests can
//! reach it directly.

pub mod demo_tasks;
