use std::{fmt, time::Duration};

use tokio::select;
use tokio_util::sync::CancellationToken;

/// Work was abandoned because cancellation was requested.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Sleeps for the given duration, unless cancellation is requested first.
///
/// Cancellation is checked before sleeping, so a zero-length sleep still observes a pending cancellation.
pub(crate) async fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    if cancel.is_cancelled() {
        return Err(Cancelled);
    }

    if duration.is_zero() {
        return Ok(());
    }

    select! {
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes() {
        let cancel = CancellationToken::new();
        assert_eq!(sleep_unless_cancelled(Duration::from_secs(5), &cancel).await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_interrupted() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        assert_eq!(
            sleep_unless_cancelled(Duration::from_secs(3600), &cancel).await,
            Err(Cancelled)
        );
    }

    #[tokio::test]
    async fn pending_cancellation_observed_before_sleep() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(sleep_unless_cancelled(Duration::ZERO, &cancel).await, Err(Cancelled));
    }
}
