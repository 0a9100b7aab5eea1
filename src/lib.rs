//! # Bracket Trader
//!
//! A long-only equity decision engine: gate and score a symbol universe,
//! size entries against portfolio risk limits, submit bracket orders and
//! ratchet protective stops on open positions.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `market_data`: Snapshot and alternative-data provider, cache and retry
//! - `broker`: Broker trait, Alpaca REST client and paper broker
//! - `strategy`: Gates, fast lane, scoring, scanning and order plans
//! - `risk`: Daily limits, sizing, safeguards and position protection
//! - `engine`: Scan and protection drivers
//! - `persistence`: SQLite-backed daily state, position state and decisions
//! - `decision`: Reason codes and per-symbol decision records
//! - `utils`: Shared utilities and decimal arithmetic

pub mod broker;
pub mod config;
pub mod decision;
pub mod engine;
pub mod market_data;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
