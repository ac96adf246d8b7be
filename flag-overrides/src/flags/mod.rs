pub mod flag_models;
pub mod flag_store;
pub mod memory_store;
pub mod override_models;
pub mod pg_store;
pub mod resolver;
