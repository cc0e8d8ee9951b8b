//! Exchange implementations - gateways behind [`crate::core::ExchangeGateway`]

pub mod paper;

pub use paper::PaperExchange;
