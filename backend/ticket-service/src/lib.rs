//! Ticket producer and consumer processes built on `ticket-stream`.

pub mod config;
pub mod consumer_loop;
pub mod monitoring;
pub mod producer_loop;
pub mod shutdown;
pub mod telemetry;
pub mod ticket;
