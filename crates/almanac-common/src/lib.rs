pub mod chains;
pub mod codec;
pub mod db;
pub mod error;
pub mod types;

pub use error::AlmanacError;
pub use types::*;
