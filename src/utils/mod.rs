pub mod file_helpers;
pub mod scheduler;

pub use file_helpers::*;
pub use scheduler::{Debouncer, Throttler};
