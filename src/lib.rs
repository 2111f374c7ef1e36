//! gearq - a Gearman-compatible job broker
//!
//! Clients submit named jobs, the server queues them per function and
//! priority, and workers that registered the function pick them up and
//! report results back through the server.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod job;
mod pool;
pub mod protocol;
pub mod server;
pub mod tls;
pub mod worker;

pub use client::Client;
pub use config::{ServerConfig, TlsConfig};
pub use connection::ConnectionState;
pub use error::{Error, Result};
pub use job::{Job, JobState, JobStatus, Priority};
pub use pool::DEFAULT_SERVER_TIMEOUT;
pub use server::Server;
pub use worker::{Worker, WorkerJob};
