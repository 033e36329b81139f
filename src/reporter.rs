// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::errors::{AmqpError, ErrorKind};
use tracing::error;

/// One-way sink for failures the appender cannot return to a caller.
///
/// Implementations must not panic and must not log back into the appender.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, message: &str, cause: Option<&AmqpError>, kind: ErrorKind);
}

/// Reports through `tracing` under this crate's target, which the appender's
/// own layer ignores.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, message: &str, cause: Option<&AmqpError>, kind: ErrorKind) {
        match cause {
            Some(err) => error!(kind = kind.as_str(), error = err.to_string(), "{}", message),
            None => error!(kind = kind.as_str(), "{}", message),
        }
    }
}
