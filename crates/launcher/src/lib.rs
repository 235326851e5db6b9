//! Process entry point around `ddp-core`: config loading, logging, local
//! rank spawning and the worker that hands over to the application.

pub mod config;
pub mod logging;
pub mod spawn;
pub mod worker;
