pub mod error;
pub mod memory;
pub mod schedule;
pub mod traits;
pub mod types;

pub use error::*;
pub use memory::{LogAlertSink, MemoryStore};
pub use schedule::PeriodicTask;
pub use traits::*;
pub use types::*;
