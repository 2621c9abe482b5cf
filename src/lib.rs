pub mod api;
pub mod core;
pub mod error;
pub mod logging;
pub mod rates;

pub use error::{Error, Result};
