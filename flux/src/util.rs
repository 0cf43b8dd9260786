use slog::Logger;
use std::fmt::Display;

/// A "log and swallow" pattern for operations whose failure is recoverable
/// at the call site but still worth a line in the log.
pub trait LogErr<T, E> {
    fn log_err(self, log: &Logger, context: &str) -> Result<T, E>;
}

impl<T, E: Display> LogErr<T, E> for Result<T, E> {
    fn log_err(self, log: &Logger, context: &str) -> Result<T, E> {
        if let Err(ref e) = self {
            slog::error!(log, "{}", context; "error" => %e);
        }
        self
    }
}
