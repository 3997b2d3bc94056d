use crate::error::CoreError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Race a unit of work against a deadline.
///
/// The task runs on its own tokio task and receives a [`CancellationToken`].
/// When the deadline wins, the caller gets [`CoreError::Timeout`] and the
/// token is cancelled; the task itself is left running until it notices.
/// Ties go to the task: the select is biased toward its outcome.
///
/// A zero timeout fails immediately without launching the task. If the
/// returned future is dropped early the token is cancelled as well.
#[tracing::instrument(level = "debug", skip_all, fields(timeout_ms = duration_ms(timeout)))]
pub async fn run_with_timeout<F, Fut, T, E>(task: F, timeout: Duration) -> Result<T, E>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<CoreError> + Send + 'static,
{
    let timeout_ms = duration_ms(timeout);
    let cancel = CancellationToken::new();
    if timeout.is_zero() {
        cancel.cancel();
        return Err(CoreError::Timeout { timeout_ms }.into());
    }

    let guard = cancel.clone().drop_guard();
    let mut handle = tokio::spawn(task(cancel.clone()));
    let sleep = tokio::time::sleep(timeout);
    tokio::pin!(sleep);

    tokio::select! {
        biased;
        joined = &mut handle => {
            guard.disarm();
            match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "unit of work aborted before completing");
                    Err(CoreError::TaskFailure(format!("unit of work aborted: {e}")).into())
                }
            }
        }
        () = &mut sleep => {
            cancel.cancel();
            guard.disarm();
            tracing::warn!(timeout_ms, "unit of work timed out; cancellation requested");
            Err(CoreError::Timeout { timeout_ms }.into())
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
