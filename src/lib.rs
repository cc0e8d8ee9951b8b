//! basket-tx - Core Library
//! Risk-bounded quoting and cross-venue arbitrage decision core

// Public modules
pub mod core;
pub mod orderbook;
pub mod risk;
pub mod strategy;
pub mod execution;
pub mod engine;
pub mod report;
pub mod exchanges;

// Re-exports
pub use core::{Config, Error, Result};
