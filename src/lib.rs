pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod validation;

#[cfg(test)]
mod test_support;

pub use error::AppError;
pub use models::*;
pub use services::*;
