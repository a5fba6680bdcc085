pub mod error;
pub mod throttler;
