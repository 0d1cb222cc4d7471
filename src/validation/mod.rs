pub mod payload_validator;

pub use payload_validator::*;
