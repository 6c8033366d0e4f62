//! RelayQueue router
//!
//! - `Pool`: named collection of queues, routes dispatch by queue name and
//!   fans out the queues' run loops
//! - `PoolHandle`: a pool running in the background, with bounded drain on
//!   shutdown

pub mod lifecycle;
pub mod pool;

pub use lifecycle::PoolHandle;
pub use pool::Pool;
