//! Brokerage integration: a live REST client and an in-memory paper broker.

mod alpaca;
mod paper;
mod traits;
mod types;

pub use alpaca::AlpacaClient;
pub use paper::{PaperBroker, PaperState};
pub use traits::{Broker, BrokerError};
pub use types::*;
