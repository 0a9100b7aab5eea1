//! Scheduler loop wiring the scanner, risk manager, executor and protector.
//!
//! Two periodic drivers share one [`TradingEngine`]:
//! - the scan driver: market check, protection pass, scan, ranked submissions
//! - the protection driver: break-even and trailing-stop management

mod scheduler;
mod shutdown;

pub use scheduler::{ScanTickReport, TradingEngine};
pub use shutdown::Shutdown;
