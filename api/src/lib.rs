pub mod auth;
pub mod config;
pub mod errors;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod password;
pub mod rate_limit;
pub mod rest;
pub mod sensors;
pub mod store;
pub mod token;
pub mod validate;
