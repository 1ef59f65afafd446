pub mod artifact;
pub mod config;
pub mod errors;
pub mod settings;

pub use artifact::*;
pub use config::*;
pub use errors::*;
pub use settings::*;
