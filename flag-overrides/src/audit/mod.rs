pub mod audit_models;
pub mod recorder;
