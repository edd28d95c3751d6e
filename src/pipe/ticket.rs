use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TicketError {
    #[error("ticket pool is closed")]
    Closed,
}

/// Fixed-size pool of tickets capping how many tasks run at once.
///
/// `take` waits until a ticket is free. A ticket goes back to the pool when it
/// is dropped or explicitly returned with [`Ticket::give_back`], so the pool
/// never holds more than `total` tickets. Waiters are served in FIFO order.
#[derive(Debug, Clone)]
pub struct TicketPool {
    total: usize,
    tickets: Arc<Semaphore>,
}

/// A ticket taken from a [`TicketPool`]
#[derive(Debug)]
pub struct Ticket {
    _permit: OwnedSemaphorePermit,
}

impl Ticket {
    /// Hand the ticket back to its pool
    pub fn give_back(self) {
        drop(self);
    }
}

impl TicketPool {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            tickets: Arc::new(Semaphore::new(total)),
        }
    }

    /// Take a ticket, waiting for one to be returned if the pool is empty
    pub async fn take(&self) -> Result<Ticket, TicketError> {
        let permit = self
            .tickets
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TicketError::Closed)?;

        Ok(Ticket { _permit: permit })
    }

    /// Take a ticket only if one is free right now
    pub fn try_take(&self) -> Option<Ticket> {
        self.tickets
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Ticket { _permit: permit })
    }

    /// Whether the pool still hands out tickets
    pub fn active(&self) -> bool {
        !self.tickets.is_closed()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Tickets currently available
    pub fn remainder(&self) -> usize {
        self.tickets.available_permits()
    }

    /// Stop handing out tickets; pending and future `take` calls fail
    pub fn close(&self) {
        self.tickets.close();
    }
}
