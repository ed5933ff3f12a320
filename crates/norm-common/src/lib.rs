pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{CodecConfig, NormConfig, WireConfig};
pub use error::{NormError, NormResult};
pub use logging::init_logging;
pub use types::*;
