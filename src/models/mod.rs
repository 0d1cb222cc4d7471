pub mod execution;
pub mod field_contract;
pub mod operation;
pub mod plan;
pub mod result;
pub mod source;

pub use execution::*;
pub use field_contract::*;
pub use operation::*;
pub use plan::*;
pub use result::*;
pub use source::*;
