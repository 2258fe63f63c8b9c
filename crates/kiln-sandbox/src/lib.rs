//! Isolated execution of build commands.
//!
//! A [`SandboxCommand`] describes one `sh -c` invocation together with the
//! exact environment, `PATH` and filesystem view it may use. [`run`] executes
//! it with combined output captured to a log file, a deadline, and a
//! [`CancelToken`].

#![forbid(unsafe_code)]

pub mod cancel;
pub mod command;
pub mod error;
pub mod exec;

pub use cancel::{cancel_on_interrupt, CancelToken};
pub use command::{bwrap_available, SandboxCommand};
pub use error::SandboxError;
pub use exec::{read_log_tail, run, ExecOutcome, ExitKind};
