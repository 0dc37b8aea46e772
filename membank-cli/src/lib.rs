//! `membank-cli`: a thin `clap`-based binary exercising the `membank`
//! manager facade from a terminal. Not where any core invariant is
//! enforced — that lives in the `membank` library.

pub mod command;
pub mod config;
pub mod trace;
