use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::pipe::ticket::TicketPool;

/// Runs an async worker over a list of tasks with bounded fan-out.
///
/// At most `concurrency` workers are in flight. The first worker error raises
/// a stop sign: tasks not yet started are skipped, running ones finish, and
/// that first error is returned.
pub struct Pipe<T> {
    tasks: Vec<T>,
    concurrency: usize,
}

impl<T: Send + 'static> Pipe<T> {
    /// Concurrency is clamped to `1..=tasks.len()`
    pub fn new(tasks: Vec<T>, concurrency: usize) -> Self {
        let concurrency = concurrency.clamp(1, tasks.len().max(1));
        Self { tasks, concurrency }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run<F, Fut, E>(self, worker: F) -> Result<(), E>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        let tickets = TicketPool::new(self.concurrency);
        let worker = Arc::new(worker);
        let stop = Arc::new(AtomicBool::new(false));
        let mut running = JoinSet::new();

        for task in self.tasks {
            let Ok(ticket) = tickets.take().await else {
                break;
            };
            if stop.load(Ordering::SeqCst) {
                debug!("Pipe stopped, skipping remaining tasks");
                break;
            }

            let worker = worker.clone();
            let stop = stop.clone();
            running.spawn(async move {
                let result = worker(task).await;
                if result.is_err() {
                    stop.store(true, Ordering::SeqCst);
                }
                ticket.give_back();
                result
            });
        }

        let mut first_error = None;
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => error!("Pipe worker panicked: {}", e),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
