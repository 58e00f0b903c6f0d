//! Cancellable request context passed to every backend operation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Cancellation token plus optional deadline.
///
/// Cloning shares the token, so cancelling any clone cancels all of them.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Child context: cancelled with the parent, cancellable on its own.
    pub fn child(&self) -> Self {
        Self { token: self.token.child_token(), deadline: self.deadline }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Drive `fut` to completion unless the context is cancelled or expires
    /// first, in which case the future is dropped and `Error::Cancelled` returned.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            _ = sleep_until(self.deadline) => Err(Error::Cancelled),
            res = fut => res,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_passes_through_results() {
        let ctx = RequestContext::new();
        let v = ctx.run(async { Ok::<_, Error>(7) }).await.unwrap();
        assert_eq!(v, 7);
        let e = ctx.run(async { Err::<(), _>(Error::transport("down")) }).await.unwrap_err();
        assert!(e.is_retryable());
    }

    #[tokio::test]
    async fn cancelled_context_never_polls_the_future() {
        let ctx = RequestContext::new();
        ctx.cancel();
        let polled = std::sync::atomic::AtomicBool::new(false);
        let res = ctx
            .run(async {
                polled.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(Error::Cancelled)));
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_future() {
        let ctx = RequestContext::new();
        let c2 = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            c2.cancel();
        });
        let res = ctx.run(async { std::future::pending::<Result<()>>().await }).await;
        assert!(res.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn deadline_expiry_is_a_cancellation() {
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(5));
        let res = ctx.run(async { std::future::pending::<Result<()>>().await }).await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[test]
    fn child_follows_parent() {
        let parent = RequestContext::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
