pub mod api;
pub mod audit;
pub mod config;
pub mod flags;
pub mod metrics_consts;
pub mod metrics_utils;
pub mod router;
pub mod server;
pub mod service;
pub mod sse;
