pub mod config;
pub mod errors;
pub mod types;

pub use config::SessionConfig;
pub use errors::PairLinkError;
pub use types::*;
