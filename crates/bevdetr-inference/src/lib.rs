mod error;
pub mod postprocessing;

pub use error::*;
pub use postprocessing::*;
