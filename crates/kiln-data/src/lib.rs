pub mod archive;
pub mod volume;
pub mod weights;

pub use archive::*;
pub use volume::*;
pub use weights::*;
