//! Resumable web spider.
//!
//! A [`crawler::Spider`] keeps its frontier in a [`storage::DurableQueue`] and the
//! URLs it has processed in a [`storage::VisitHistory`], both embedded `redb`
//! stores, so a crawl survives restarts. [`pipe::TicketPool`] and [`pipe::Pipe`]
//! bound how many tasks run at once.

pub mod crawler;
pub mod fetch;
pub mod pipe;
pub mod storage;
pub mod utils;
