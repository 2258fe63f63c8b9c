use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::SandboxError;

/// Shared cancellation flag.
///
/// Clones observe the same flag. Once cancelled a token stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM; exit with status 130 on
/// the second.
///
/// Blocks both signals in the calling thread and hands them to a dedicated
/// waiter thread. Call it from the main thread before any worker threads
/// start so they inherit the mask. Spawned build processes start with an
/// empty mask.
///
/// # Errors
/// Returns an error if the signal mask cannot be changed or the waiter
/// thread cannot be started.
#[cfg(unix)]
pub fn cancel_on_interrupt(token: &CancelToken) -> Result<(), SandboxError> {
    spawn_interrupt_waiter(token)?;
    Ok(())
}

#[cfg(unix)]
fn spawn_interrupt_waiter(
    token: &CancelToken,
) -> Result<std::thread::JoinHandle<()>, SandboxError> {
    use nix::sys::signal::{SigSet, Signal};

    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block().map_err(|e| SandboxError::Signal {
        message: e.to_string(),
    })?;

    let token = token.clone();
    std::thread::Builder::new()
        .name("kiln-interrupt".to_owned())
        .spawn(move || loop {
            match signals.wait() {
                Ok(signal) if token.is_cancelled() => {
                    tracing::warn!(signal = signal.as_str(), "interrupted again, exiting");
                    std::process::exit(130);
                }
                Ok(signal) => {
                    tracing::warn!(
                        signal = signal.as_str(),
                        "interrupted, stopping running builds"
                    );
                    token.cancel();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stopped waiting for interrupts");
                    return;
                }
            }
        })
        .map_err(|e| SandboxError::Signal {
            message: e.to_string(),
        })
}

/// Interrupts keep their default behavior on platforms without POSIX signals.
///
/// # Errors
/// Never fails on this platform.
#[cfg(not(unix))]
pub fn cancel_on_interrupt(_token: &CancelToken) -> Result<(), SandboxError> {
    tracing::debug!("interrupt handling is not available on this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[cfg(unix)]
    #[test]
    #[allow(clippy::unwrap_used)]
    fn sigterm_cancels_the_token() {
        use std::os::unix::thread::JoinHandleExt;
        use std::time::{Duration, Instant};

        use nix::sys::pthread::pthread_kill;
        use nix::sys::signal::Signal;

        let token = CancelToken::new();
        let waiter = spawn_interrupt_waiter(&token).unwrap();
        pthread_kill(waiter.as_pthread_t(), Signal::SIGTERM).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !token.is_cancelled() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(token.is_cancelled());
    }
}
