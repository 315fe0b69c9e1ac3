//! Database module for SQLite persistence.

mod device;
mod history;
mod operations;
mod pool;
mod state;

pub use device::*;
pub use history::*;
pub use operations::*;
pub use pool::*;
pub use state::*;
