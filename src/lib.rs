pub mod config;
pub mod crm;
pub mod errors;
pub mod telemetry;
