//! Cancellable waits.
//!
//! Timed holds (output on for N seconds, sweep dwells, burst holds) all wait
//! through a [`CancelToken`]. A [`CancelHandle`] fires every token cloned from
//! it, and [`CancelHandle::cancel_on_ctrl_c`] wires it to the terminal.

use crate::error::BenchError;
use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Default interval between countdown events.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Sender side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A token observing this handle.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Fire on the first Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl-C received, cancelling");
                handle.cancel();
            }
        })
    }
}

/// Receiver side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that never fires.
    pub fn never() -> Self {
        CancelHandle::new().token()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Never resolves if the handle is dropped first.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// `Err(Cancelled)` if cancelled now.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(BenchError::Cancelled.into());
        }
        Ok(())
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(BenchError::Cancelled.into()),
        }
    }
}

/// A countdown that reports the remaining time every tick.
#[derive(Debug, Clone)]
pub struct Countdown {
    duration: Duration,
    tick: Duration,
}

impl Countdown {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Count down to zero, calling `on_tick` with the remaining time at the
    /// start and after every tick (the last call reports zero).
    ///
    /// Returns `Cancelled` as soon as `cancel` fires.
    pub async fn run<F>(&self, cancel: &CancelToken, mut on_tick: F) -> Result<()>
    where
        F: FnMut(Duration),
    {
        if self.tick.is_zero() {
            return Err(BenchError::InvalidInput("countdown tick must be positive".into()).into());
        }
        let deadline = Instant::now().checked_add(self.duration).ok_or_else(|| {
            BenchError::InvalidInput(format!(
                "countdown of {} s is too long",
                self.duration.as_secs_f64()
            ))
        })?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            on_tick(remaining);
            if remaining.is_zero() {
                return Ok(());
            }
            cancel.sleep(remaining.min(self.tick)).await.map_err(|e| {
                tracing::warn!(remaining_s = remaining.as_secs_f64(), "countdown cancelled");
                e
            })?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_countdown_reports_each_tick() {
        let mut seen = Vec::new();
        Countdown::new(Duration::from_secs(3))
            .run(&CancelToken::never(), |remaining| seen.push(remaining.as_secs()))
            .await
            .unwrap();
        assert_eq!(seen, vec![3, 2, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_cancelled() {
        let handle = CancelHandle::new();
        let token = handle.token();
        let canceller = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });

        let mut ticks = 0;
        let err = Countdown::new(Duration::from_secs(10))
            .run(&token, |_| ticks += 1)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<BenchError>(), Some(BenchError::Cancelled)));
        assert_eq!(ticks, 2);
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_sleep_after_cancel_returns_immediately() {
        let handle = CancelHandle::new();
        handle.cancel();
        assert!(handle.token().sleep(Duration::from_secs(60)).await.is_err());
        assert!(handle.token().check().is_err());
    }

    #[tokio::test]
    async fn test_zero_tick_rejected() {
        let countdown = Countdown::new(Duration::from_secs(1)).with_tick(Duration::ZERO);
        assert!(countdown.run(&CancelToken::never(), |_| {}).await.is_err());
    }

    #[tokio::test]
    async fn test_unbounded_duration_rejected() {
        let mut ticks = 0;
        let err = Countdown::new(Duration::MAX)
            .run(&CancelToken::never(), |_| ticks += 1)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<BenchError>(), Some(BenchError::InvalidInput(_))));
        assert_eq!(ticks, 0);
    }
}
