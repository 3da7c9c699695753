pub mod config;
pub mod dataset;
pub mod document;
pub mod mutation;

pub use config::*;
pub use dataset::*;
pub use document::*;
pub use mutation::*;
