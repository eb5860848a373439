use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Error type for polling operations
#[derive(Debug)]
pub enum PollError<E> {
    /// Operation timed out
    Timeout,
    /// The cancellation token fired while waiting
    Cancelled,
    /// Error occurred in the condition/operation function
    ConditionError(E),
}

impl<E> std::fmt::Display for PollError<E>
where
    E: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Timeout => write!(f, "Operation timed out"),
            PollError::Cancelled => write!(f, "Operation cancelled"),
            PollError::ConditionError(e) => write!(f, "Condition error: {}", e),
        }
    }
}

impl<E> std::error::Error for PollError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Timeout | PollError::Cancelled => None,
            PollError::ConditionError(e) => Some(e),
        }
    }
}

/// Shared cancel flag. Sleeping through [`CancellationToken::sleep`] wakes
/// as soon as the token is cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock() = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for `duration`. Returns `false` if cancelled before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut cancelled = flag.lock();
        while !*cancelled {
            if cvar.wait_until(&mut cancelled, deadline).timed_out() {
                return !*cancelled;
            }
        }
        false
    }
}

/// Poll `condition` until it returns `Ok(true)`, the timeout passes or
/// `cancel` fires
///
/// The condition is checked once more at the deadline so a slow poll interval
/// never hides a condition that became true during the last sleep.
pub fn poll_until_cancellable<F, E>(
    mut condition: F,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Result<bool, E>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        match condition() {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => return Err(PollError::ConditionError(e)),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout);
        }
        if !cancel.sleep(poll_interval.min(deadline - now)) {
            return Err(PollError::Cancelled);
        }
    }
}

/// Poll with timeout for operations that may return a result
///
/// Repeatedly calls `operation` until it returns `Ok(Some(T))` or timeout is reached.
///
/// # Returns
/// * `Ok(Some(T))` when operation returns `Ok(Some(T))`
/// * `Ok(None)` when timeout is reached
/// * `Err(PollError::ConditionError(e))` when operation returns an error
pub fn poll_with_timeout<F, T, E>(
    mut operation: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Option<T>, PollError<E>>
where
    F: FnMut() -> Result<Option<T>, E>,
{
    let start = Instant::now();

    loop {
        if start.elapsed() >= timeout {
            return Ok(None);
        }

        match operation() {
            Ok(Some(result)) => return Ok(Some(result)),
            Ok(None) => {
                std::thread::sleep(poll_interval);
            }
            Err(e) => return Err(PollError::ConditionError(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_with_timeout_error() {
        let result = poll_with_timeout(
            || Err::<Option<()>, &str>("test error"),
            Duration::from_millis(100),
            Duration::from_millis(10),
        );

        assert!(matches!(result, Err(PollError::ConditionError("test error"))));
    }

    #[test]
    fn test_cancel_wakes_sleeper() {
        let token = CancellationToken::new();
        let sleeper = token.clone();
        let start = Instant::now();
        let handle = std::thread::spawn(move || sleeper.sleep(Duration::from_secs(30)));

        std::thread::sleep(Duration::from_millis(50));
        token.cancel();

        assert!(!handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_sleep_completes_without_cancel() {
        let token = CancellationToken::new();
        assert!(token.sleep(Duration::from_millis(20)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancellable_poll_stops_on_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        let result = poll_until_cancellable(
            || Ok::<bool, &str>(false),
            Duration::from_secs(10),
            Duration::from_millis(10),
            &token,
        );
        assert!(matches!(result, Err(PollError::Cancelled)));
    }

    #[test]
    fn test_cancellable_poll_checks_at_deadline() {
        let token = CancellationToken::new();
        let start = Instant::now();
        let result = poll_until_cancellable(
            || Ok::<bool, &str>(start.elapsed() >= Duration::from_millis(40)),
            Duration::from_millis(40),
            Duration::from_secs(1),
            &token,
        );
        assert!(result.is_ok());
    }
}
