//! Training metrics loggers.
//!
//! - [`ConsoleLogger`]: one `log::info!` line per record
//! - [`CsvLogger`]: CSV file logging for analysis
//! - [`MultiLogger`]: combine multiple loggers

pub mod logger;

pub use logger::{ConsoleLogger, CsvLogger, MetricsLogger, MultiLogger};
