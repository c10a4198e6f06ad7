//! Callback delivery.
//!
//! Application callbacks never run inside the call that triggered them. Each
//! one becomes a [`Job`] queued on a [`Dispatcher`], which hands jobs to the
//! embedding application's [`Executor`] one at a time, in order, exactly once.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::error::StreamError;

/// One unit of callback work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Receives server pushes
pub type PushCallback = Arc<dyn Fn(Bytes) + Send + Sync + 'static>;

/// Told once per failure episode that the live connection was lost
pub type PeerClosedCallback = Arc<dyn Fn(StreamError) + Send + Sync + 'static>;

/// Execution context supplied by the embedding application
pub trait Executor: Send + Sync + 'static {
    /// Run `job`, now or later, exactly once
    fn execute(&self, job: Job);
}

impl<F> Executor for F
where
    F: Fn(Job) + Send + Sync + 'static,
{
    fn execute(&self, job: Job) {
        self(job)
    }
}

/// Runs each job directly on the dispatcher task
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job()
    }
}

/// Ordered queue feeding an [`Executor`]
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Dispatcher {
    /// Start a dispatcher task on the current tokio runtime
    pub fn spawn(executor: Arc<dyn Executor>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                executor.execute(job);
            }
            trace!("Dispatcher stopped");
        });
        Self { tx }
    }

    /// Queue a job
    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            trace!("Dispatcher gone; dropping callback");
        }
    }
}

/// Where the outcome of a connect or request goes.
///
/// A `Handler` is queued on its dispatcher the moment the engine completes
/// it, so handler callbacks and pushes reach the executor in the order the
/// engine produced them.
pub enum Completion<T> {
    /// Hand the outcome to an awaiting caller
    Channel(oneshot::Sender<Result<T, StreamError>>),
    /// Run a caller-supplied handler as a dispatched job
    Handler {
        /// Queue the handler runs on
        dispatcher: Dispatcher,
        /// Caller-supplied handler
        handler: Box<dyn FnOnce(Result<T, StreamError>) + Send + 'static>,
    },
}

impl<T: Send + 'static> Completion<T> {
    /// Completion running `handler` on `dispatcher`
    pub fn handler<F>(dispatcher: Dispatcher, handler: F) -> Self
    where
        F: FnOnce(Result<T, StreamError>) + Send + 'static,
    {
        Completion::Handler {
            dispatcher,
            handler: Box::new(handler),
        }
    }

    /// Deliver `result`; returns false when nobody is left to receive it
    pub fn complete(self, result: Result<T, StreamError>) -> bool {
        match self {
            Completion::Channel(tx) => tx.send(result).is_ok(),
            Completion::Handler {
                dispatcher,
                handler,
            } => {
                dispatcher.dispatch(move || handler(result));
                true
            }
        }
    }
}

impl<T> From<oneshot::Sender<Result<T, StreamError>>> for Completion<T> {
    fn from(tx: oneshot::Sender<Result<T, StreamError>>) -> Self {
        Completion::Channel(tx)
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Channel(tx) => f
                .debug_tuple("Channel")
                .field(&if tx.is_closed() { "closed" } else { "open" })
                .finish(),
            Completion::Handler { dispatcher, .. } => {
                f.debug_struct("Handler").field("dispatcher", dispatcher).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let dispatcher = Dispatcher::spawn(Arc::new(InlineExecutor));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        for i in 0..10 {
            let seen = Arc::clone(&seen);
            dispatcher.dispatch(move || seen.lock().unwrap().push(i));
        }
        dispatcher.dispatch(move || {
            let _ = done_tx.send(());
        });

        done_rx.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_custom_executor_sees_every_job() {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();
        let executor = move |job: Job| {
            let _ = job_tx.send(job);
        };
        let dispatcher = Dispatcher::spawn(Arc::new(executor));

        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..3 {
            let tx = tx.clone();
            dispatcher.dispatch(move || {
                let _ = tx.send(i);
            });
        }

        // the application decides when to run the jobs
        for _ in 0..3 {
            let job = job_rx.recv().await.unwrap();
            job();
        }
        assert_eq!(rx.recv().await, Some(0));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_handler_completion_is_queued_in_call_order() {
        let dispatcher = Dispatcher::spawn(Arc::new(InlineExecutor));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handler_tx = tx.clone();
        let completion = Completion::handler(
            dispatcher.clone(),
            move |result: Result<u8, StreamError>| {
                let _ = handler_tx.send(format!("handler {:?}", result));
            },
        );
        assert!(completion.complete(Ok(1)));
        dispatcher.dispatch(move || {
            let _ = tx.send("job".to_string());
        });

        assert_eq!(rx.recv().await.unwrap(), "handler Ok(1)");
        assert_eq!(rx.recv().await.unwrap(), "job");
    }

    #[tokio::test]
    async fn test_channel_completion_reports_dropped_receiver() {
        let (tx, rx) = oneshot::channel::<Result<u8, StreamError>>();
        drop(rx);
        assert!(!Completion::from(tx).complete(Ok(1)));
    }
}
