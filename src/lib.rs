pub mod augment;
pub mod data;
pub mod error;
pub mod logging;
pub mod model;
pub mod module;
pub mod regressor;
pub mod training;

pub use error::{Error, Result};
