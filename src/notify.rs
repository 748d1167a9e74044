//! Asynchronous rejection delivery.
//!
//! Discards, cancellations of queued work, and group timeouts must reach the
//! caller's completion sink without re-entering the call that triggered them
//! and without holding any scheduler or runner lock. A single dispatcher
//! thread drains a channel of pending rejections and invokes the sinks.

use crate::error::Error;
use crate::executor::task::CompletionSink;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};

pub(crate) struct Notice {
    pub sink: CompletionSink,
    pub error: Error,
}

pub(crate) struct Notifier {
    sender: Mutex<Option<Sender<Notice>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded::<Notice>();
        let handle = thread::Builder::new()
            .name("taskpool-notify".to_string())
            .spawn(move || {
                for notice in receiver {
                    (notice.sink)(Err(notice.error));
                }
            })
            .ok();

        if handle.is_none() {
            tracing::warn!("notifier thread failed to start; rejections deliver inline");
        }

        Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(handle),
        }
    }

    /// Queues a rejection for off-stack delivery.
    pub fn reject(&self, sink: CompletionSink, error: Error) {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(sender) => {
                if let Err(err) = sender.send(Notice { sink, error }) {
                    // Dispatcher already gone; last resort is inline delivery.
                    let notice = err.into_inner();
                    (notice.sink)(Err(notice.error));
                }
            }
            None => (sink)(Err(error)),
        }
    }

    /// Drains queued rejections and stops the dispatcher.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crossbeam_channel::bounded;
    use std::time::Duration;

    #[test]
    fn test_rejection_delivered_off_stack() {
        let notifier = Notifier::new();
        let (tx, rx) = bounded(1);

        let caller = thread::current().id();
        notifier.reject(
            Box::new(move |outcome| {
                let on_caller_thread = thread::current().id() == caller;
                let _ = tx.send((outcome, on_caller_thread));
            }),
            Error::discarded("evicted"),
        );

        let (outcome, on_caller_thread) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!on_caller_thread);
        assert_eq!(outcome.unwrap_err().code(), Some(ErrorCode::Discarded));
    }

    #[test]
    fn test_shutdown_drains_pending() {
        let notifier = Notifier::new();
        let (tx, rx) = bounded(16);

        for _ in 0..16 {
            let tx = tx.clone();
            notifier.reject(
                Box::new(move |_| {
                    let _ = tx.send(());
                }),
                Error::canceled("torn down"),
            );
        }
        notifier.shutdown();
        assert_eq!(rx.try_iter().count(), 16);
    }
}
