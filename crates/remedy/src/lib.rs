//! Remedy - worker and operator commands for the ticket engine
//!
//! Every command prints one JSON envelope on stdout. Logs go to stderr.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![forbid(unsafe_code)]

pub mod cli;
pub mod output;
