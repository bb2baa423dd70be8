pub mod config;
pub mod error;
pub mod paths;
pub mod step;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use paths::Paths;
pub use step::{StepAction, StructuredStep};
