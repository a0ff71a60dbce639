pub mod env;
pub mod lock;
pub mod telemetry;
