pub mod models;
pub mod utils;

pub use models::*;
pub use utils::error::NetworkFailure;
