use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// Per-conversation FIFO runner.
///
/// Work submitted under one key runs strictly one at a time in submission
/// order; distinct keys never wait on each other. Each submission holds a
/// one-shot "done" signal that its successor awaits, and the key's entry only
/// lives while some submission for that key is pending or running.
#[derive(Clone, Default)]
pub struct ChatRunQueue {
    inner: Arc<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    tails: Mutex<HashMap<String, Tail>>,
    next_ticket: AtomicU64,
}

/// Completion handle of the newest submission for a key.
struct Tail {
    ticket: u64,
    done: oneshot::Receiver<()>,
}

impl ChatRunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with pending or running work.
    pub fn active_keys(&self) -> usize {
        self.inner.lock_tails().len()
    }

    /// Queue `task` behind every earlier submission for `key`.
    ///
    /// The place in line is taken when `enqueue` is called, so the returned
    /// future may be spawned or awaited later without reordering. The task's
    /// outcome, failure included, goes only to the holder of that future.
    /// Dropping the future before it runs keeps the chain intact; dropping
    /// it mid-run releases the next submission immediately.
    pub fn enqueue<F, Fut, T, E>(
        &self,
        key: &str,
        task: F,
    ) -> impl Future<Output = Result<T, E>> + use<F, Fut, T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut turn = self.inner.clone().take_turn(key);
        async move {
            turn.wait_for_predecessor().await;
            let outcome = task().await;
            drop(turn);
            outcome
        }
    }
}

impl QueueInner {
    fn lock_tails(&self) -> MutexGuard<'_, HashMap<String, Tail>> {
        self.tails.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_turn(self: Arc<Self>, key: &str) -> Turn {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        let previous = {
            let mut tails = self.lock_tails();
            tails
                .insert(
                    key.to_string(),
                    Tail {
                        ticket,
                        done: done_rx,
                    },
                )
                .map(|tail| tail.done)
        };
        tracing::trace!(key, ticket, queued = previous.is_some(), "chat run queued");
        Turn {
            queue: self,
            key: key.to_string(),
            ticket,
            previous,
            done: Some(done_tx),
        }
    }

    /// Drop the key's entry unless a newer submission replaced it.
    fn release(&self, key: &str, ticket: u64) {
        let mut tails = self.lock_tails();
        if tails.get(key).is_some_and(|tail| tail.ticket == ticket) {
            tails.remove(key);
            tracing::trace!(key, ticket, "chat run queue drained");
        }
    }
}

/// One submission's place in its key's chain.
struct Turn {
    queue: Arc<QueueInner>,
    key: String,
    ticket: u64,
    previous: Option<oneshot::Receiver<()>>,
    done: Option<oneshot::Sender<()>>,
}

impl Turn {
    async fn wait_for_predecessor(&mut self) {
        if let Some(previous) = self.previous.as_mut() {
            // The sender is never used; its drop is the completion signal.
            let _ = previous.await;
        }
        self.previous = None;
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        let done = self.done.take();
        let Some(previous) = self.previous.take() else {
            drop(done);
            self.queue.release(&self.key, self.ticket);
            return;
        };

        // Abandoned before its turn came: hand the predecessor's completion
        // on to our successor instead of releasing it early.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let queue = self.queue.clone();
                let key = std::mem::take(&mut self.key);
                let ticket = self.ticket;
                handle.spawn(async move {
                    let _ = previous.await;
                    drop(done);
                    queue.release(&key, ticket);
                });
            }
            Err(_) => {
                tracing::warn!(key = %self.key, "chat run abandoned outside a runtime; releasing early");
                drop(done);
                self.queue.release(&self.key, self.ticket);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type Events = Arc<Mutex<Vec<String>>>;

    fn push(events: &Events, event: &str) {
        events.lock().expect("events lock").push(event.to_string());
    }

    fn snapshot(events: &Events) -> Vec<String> {
        events.lock().expect("events lock").clone()
    }

    #[tokio::test]
    async fn same_key_runs_serially_in_submission_order() {
        let queue = ChatRunQueue::new();
        let events: Events = Arc::default();

        let e1 = events.clone();
        let first = queue.enqueue("c1", move || async move {
            push(&e1, "start1");
            tokio::time::sleep(Duration::from_millis(30)).await;
            push(&e1, "end1");
            Ok::<_, CoreError>(1)
        });
        let e2 = events.clone();
        let second = queue.enqueue("c1", move || async move {
            push(&e2, "start2");
            tokio::time::sleep(Duration::from_millis(5)).await;
            push(&e2, "end2");
            Ok::<_, CoreError>(2)
        });

        let (r1, r2) = tokio::join!(first, second);
        assert_eq!(r1.expect("first result"), 1);
        assert_eq!(r2.expect("second result"), 2);
        assert_eq!(snapshot(&events), ["start1", "end1", "start2", "end2"]);
        assert_eq!(queue.active_keys(), 0);
    }

    #[tokio::test]
    async fn submission_order_is_fixed_at_enqueue_time() {
        let queue = ChatRunQueue::new();
        let events: Events = Arc::default();

        let e1 = events.clone();
        let first = queue.enqueue("c1", move || async move {
            push(&e1, "first");
            Ok::<_, CoreError>(())
        });
        let e2 = events.clone();
        let second = queue.enqueue("c1", move || async move {
            push(&e2, "second");
            Ok::<_, CoreError>(())
        });

        // Poll the later submission first; it must still wait its turn.
        let second = tokio::spawn(second);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(snapshot(&events).is_empty());

        first.await.expect("first result");
        second.await.expect("join second").expect("second result");
        assert_eq!(snapshot(&events), ["first", "second"]);
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let queue = ChatRunQueue::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let run = |key: &str| {
            let running = running.clone();
            let peak = peak.clone();
            queue.enqueue(key, move || async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, CoreError>(())
            })
        };

        let (a, b) = tokio::join!(run("a"), run("b"));
        a.expect("a result");
        b.expect("b result");
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn failure_is_isolated_to_its_caller() {
        let queue = ChatRunQueue::new();
        let failing = queue.enqueue("c1", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<u32, _>(CoreError::TaskFailure("assistant exploded".to_string()))
        });
        let following = queue.enqueue("c1", || async { Ok::<_, CoreError>(7) });

        let (failed, followed) = tokio::join!(failing, following);
        assert!(matches!(failed, Err(CoreError::TaskFailure(_))));
        assert_eq!(followed.expect("following task runs"), 7);
    }

    #[tokio::test]
    async fn panic_does_not_stall_the_key() {
        let queue = ChatRunQueue::new();
        let panicking = tokio::spawn(queue.enqueue("c1", || async {
            if true {
                panic!("task blew up");
            }
            Ok::<(), CoreError>(())
        }));
        let following = tokio::spawn(queue.enqueue("c1", || async { Ok::<_, CoreError>("next") }));

        assert!(panicking.await.is_err());
        let next = tokio::time::timeout(Duration::from_secs(1), following)
            .await
            .expect("following task not stalled")
            .expect("join following");
        assert_eq!(next.expect("following result"), "next");
        assert_eq!(queue.active_keys(), 0);
    }

    #[tokio::test]
    async fn dropped_submission_keeps_its_place() {
        let queue = ChatRunQueue::new();
        let events: Events = Arc::default();

        let e1 = events.clone();
        let first = tokio::spawn(queue.enqueue("c1", move || async move {
            push(&e1, "start1");
            tokio::time::sleep(Duration::from_millis(30)).await;
            push(&e1, "end1");
            Ok::<_, CoreError>(())
        }));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let abandoned = queue.enqueue("c1", || async { Ok::<_, CoreError>(()) });
        drop(abandoned);

        let e3 = events.clone();
        let third = queue.enqueue("c1", move || async move {
            push(&e3, "start3");
            Ok::<_, CoreError>(())
        });
        third.await.expect("third result");
        first.await.expect("join first").expect("first result");

        assert_eq!(snapshot(&events), ["start1", "end1", "start3"]);
    }

    #[tokio::test]
    async fn idle_keys_are_cleaned_up() {
        let queue = ChatRunQueue::new();
        for key in ["a", "b", "c"] {
            queue
                .enqueue(key, || async { Ok::<_, CoreError>(()) })
                .await
                .expect("task result");
        }
        assert_eq!(queue.active_keys(), 0);

        let pending = queue.enqueue("a", || async { Ok::<_, CoreError>(()) });
        assert_eq!(queue.active_keys(), 1);
        pending.await.expect("pending result");
        assert_eq!(queue.active_keys(), 0);
    }
}
