// Library exports for testing
pub mod config;
pub mod error;
pub mod session;
pub mod token;
