use crate::admission::{Backoff, WaitOutcome};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::info;

/// Shared flag raised once the run should stop
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    // signal handlers set the flag directly in the binary
    #[cfg(test)]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancel the returned token on SIGINT or SIGTERM
///
/// A second signal while the token is already set terminates the process.
pub fn install_shutdown_handler() -> Result<CancellationToken, io::Error> {
    let token = CancellationToken::new();

    for signal in [SIGINT, SIGTERM] {
        // order matters, the conditional shutdown must see the flag before it is set
        signal_hook::flag::register_conditional_shutdown(signal, 130, Arc::clone(&token.0))?;
        signal_hook::flag::register(signal, Arc::clone(&token.0))?;
    }

    Ok(token)
}

/// Sleep in short steps, returning early once the token is cancelled
#[derive(Debug, Clone)]
pub struct CancellableSleep {
    token: CancellationToken,
    step: Duration,
}

impl CancellableSleep {
    pub fn new(token: CancellationToken) -> Self {
        Self::with_step(token, Duration::from_secs(1))
    }

    pub fn with_step(token: CancellationToken, step: Duration) -> Self {
        Self { token, step }
    }
}

impl Backoff for CancellableSleep {
    fn wait(&mut self, interval: Duration) -> WaitOutcome {
        let deadline = Instant::now() + interval;

        loop {
            if self.token.is_cancelled() {
                info!("Cancelled while backing off");

                return WaitOutcome::Cancelled;
            }

            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::Elapsed;
            }

            thread::sleep(self.step.min(deadline - now));
        }
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_elapses_without_cancellation() {
        let mut sleep =
            CancellableSleep::with_step(CancellationToken::new(), Duration::from_millis(5));
        let start = Instant::now();

        assert_eq!(sleep.wait(Duration::from_millis(30)), WaitOutcome::Elapsed);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!sleep.is_cancelled());
    }

    #[test]
    fn cancelled_token_returns_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let mut sleep = CancellableSleep::new(token);
        let start = Instant::now();

        assert_eq!(sleep.wait(Duration::from_secs(420)), WaitOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn cancellation_from_another_thread_interrupts_the_wait() {
        let token = CancellationToken::new();
        let mut sleep = CancellableSleep::with_step(token.clone(), Duration::from_millis(10));

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });
        let start = Instant::now();

        assert_eq!(sleep.wait(Duration::from_secs(60)), WaitOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
        canceller.join().unwrap();
    }
}
