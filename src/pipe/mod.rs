pub mod runner;
pub mod ticket;

// Re-export common types
pub use runner::Pipe;
pub use ticket::{Ticket, TicketError, TicketPool};
