//! Last-write-wins debouncing on top of a tokio task

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

enum Command<T> {
    Push(T),
    Flush(oneshot::Sender<()>),
    Forget,
    Stop,
}

/// Coalesces rapid pushes into a single delivery of the latest value.
///
/// Each push restarts the delay. A value equal to the last delivered one is
/// dropped. Dropping the debouncer delivers whatever is still pending.
pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Debouncer<T>
where
    T: PartialEq + Send + 'static,
{
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn new<F>(delay: Duration, mut sink: F) -> Self
    where
        F: FnMut(&T) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<T>>();

        let worker = tokio::spawn(async move {
            let mut pending: Option<T> = None;
            let mut last: Option<T> = None;
            let mut deadline = Instant::now();

            let mut deliver = |pending: &mut Option<T>, last: &mut Option<T>| {
                if let Some(value) = pending.take()
                    && last.as_ref() != Some(&value)
                {
                    sink(&value);
                    *last = Some(value);
                }
            };

            loop {
                let command = if pending.is_some() {
                    tokio::select! {
                        command = rx.recv() => command,
                        _ = sleep_until(deadline) => {
                            deliver(&mut pending, &mut last);
                            continue;
                        }
                    }
                } else {
                    rx.recv().await
                };

                match command {
                    Some(Command::Push(value)) => {
                        pending = Some(value);
                        deadline = Instant::now() + delay;
                    }
                    Some(Command::Flush(ack)) => {
                        deliver(&mut pending, &mut last);
                        let _ = ack.send(());
                    }
                    Some(Command::Forget) => {
                        pending = None;
                        last = None;
                    }
                    Some(Command::Stop) | None => {
                        deliver(&mut pending, &mut last);
                        break;
                    }
                }
            }
        });

        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Replace the pending value and restart the delay
    pub fn push(&self, value: T) {
        if self.tx.send(Command::Push(value)).is_err() {
            tracing::warn!("Debounce worker has stopped; value dropped");
        }
    }

    /// Drop the pending value and forget the last delivery, so the next push
    /// is delivered even if it equals what was delivered before
    pub fn forget(&self) {
        let _ = self.tx.send(Command::Forget);
    }

    /// Deliver the pending value now, bypassing the delay
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Deliver anything pending and stop the worker. Later pushes are dropped.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Stop);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            tracing::warn!(error = %e, "Debounce worker ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl FnMut(&u32) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        (seen, move |v: &u32| sink_seen.lock().unwrap().push(*v))
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_pushes_coalesce_to_last() {
        let (seen, sink) = recorder();
        let debouncer = Debouncer::new(Duration::from_millis(100), sink);

        debouncer.push(1);
        debouncer.push(2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        debouncer.push(3);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_values_delivered_once() {
        let (seen, sink) = recorder();
        let debouncer = Debouncer::new(Duration::from_millis(100), sink);

        debouncer.push(7);
        tokio::time::sleep(Duration::from_millis(150)).await;
        debouncer.push(7);
        tokio::time::sleep(Duration::from_millis(150)).await;
        debouncer.push(8);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(*seen.lock().unwrap(), vec![7, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_bypasses_delay() {
        let (seen, sink) = recorder();
        let debouncer = Debouncer::new(Duration::from_secs(60), sink);

        debouncer.push(1);
        debouncer.flush().await;
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_drops_pending_and_resets_last() {
        let (seen, sink) = recorder();
        let debouncer = Debouncer::new(Duration::from_millis(100), sink);

        debouncer.push(1);
        debouncer.flush().await;
        debouncer.push(2);
        debouncer.forget();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1]);

        debouncer.push(1);
        debouncer.flush().await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_delivers_pending() {
        let (seen, sink) = recorder();
        let debouncer = Debouncer::new(Duration::from_secs(60), sink);

        debouncer.push(5);
        debouncer.shutdown().await;
        assert_eq!(*seen.lock().unwrap(), vec![5]);

        debouncer.push(6);
        debouncer.shutdown().await;
        assert_eq!(*seen.lock().unwrap(), vec![5]);
    }
}
