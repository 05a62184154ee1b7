//! Logger construction helpers.
//!
//! The service and orchestrator log through a `slog::Logger` carried in
//! the [`Collaborators`](crate::service::Collaborators) value. Embedders
//! that do not care pass [`null_logger`]; interactive tools usually want
//! [`term_logger`].

use slog::{o, Drain, Logger};

/// A logger that discards everything.
pub fn null_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// A logger that writes human-readable records to the terminal.
pub fn term_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = std::sync::Mutex::new(drain).fuse();
    Logger::root(drain, o!())
}
