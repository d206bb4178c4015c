// Types Module
//
// Value, schema and result types that flow across service boundaries.

pub mod result;
pub mod schemas;
pub mod value;

pub use result::FunctionResult;
pub use schemas::{EventItemSchema, EventSchema, FunctionSchema, ParameterSchema};
pub use value::{EventItemMap, FunctionParameterMap, FunctionValue, ValueType};
