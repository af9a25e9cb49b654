pub mod btle;
pub mod constants;
pub mod decoder;
pub mod engine;
pub mod platform;
pub mod registry;
pub mod router;
pub mod session;
pub mod types;
