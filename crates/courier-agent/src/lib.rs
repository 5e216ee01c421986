//! At-least-once log shipping pipeline.
//!
//! This crate implements the delivery core of log-courier: it discovers log
//! files on a host, tails them as they grow and rotate, batches the resulting
//! events, ships those batches over a framed stream connection to an upstream
//! receiver, and persists per-file read offsets so that a restart loses
//! nothing and duplicates only a bounded window.
//!
//! # Architecture
//!
//! ```text
//!   filesystem
//!       │
//!       v
//!  ┌────────────┐   discovers files, tracks identity (device+inode)
//!  │ Prospector │   across renames, one Harvester per live file
//!  └─────┬──────┘
//!        v
//!  ┌────────────┐   per-file tail: chunked reads through a line
//!  │ Harvester  │   codec into discrete events
//!  └─────┬──────┘
//!        v
//!  ┌────────────┐   size / idle-timeout batching
//!  │  Spooler   │
//!  └─────┬──────┘
//!        v
//!  ┌────────────┐   in-flight window, nonce-keyed ack matching,
//!  │ Publisher  │   retransmission and failover
//!  └─────┬──────┘
//!        v
//!  ┌────────────┐   length-prefixed JDAT/ACKN frames over a
//!  │ Transport  │   TLS (or plain TCP) stream socket
//!  └────────────┘
//!
//!  acknowledgements flow back:
//!  Transport → Publisher → Registrar (durable offsets) → unlocks the
//!  Prospector to release state for deleted files
//! ```
//!
//! Every component is a long-lived tokio task; components communicate over
//! bounded channels and observe a single shared cancellation token for
//! shutdown. The [`agent::Agent`] wires the pipeline together; the thin
//! `log-courier` binary adds CLI parsing and signal handling on top.

pub mod agent;
pub mod config;
pub mod event;
pub mod harvester;
pub mod logger;
pub mod pipeline;
pub mod prospector;
pub mod publisher;
pub mod registrar;
pub mod snapshot;
pub mod spooler;
pub mod transport;

pub use agent::{Agent, AgentError, AgentOptions};
pub use config::Config;
pub use event::Event;
