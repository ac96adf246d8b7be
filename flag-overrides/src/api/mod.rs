pub mod actor;
pub mod endpoint;
pub mod errors;
pub mod sse_endpoint;
pub mod types;
