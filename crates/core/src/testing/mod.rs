//! Shared test utilities for ddp-core.
//!
//! Runs every rank of a small job inside one test process: one thread per
//! rank, each with its own TCP communicator over loopback.

mod ranks;

pub use ranks::{free_port, run_ranks, RANK_TIMEOUT};
