//! # mira-sink: screen-mirroring sink
//!
//! Process wrapper around `mira-core`: loads the TOML configuration,
//! opens the persisted device identity, starts the receiver and logs
//! what it reports until Ctrl-C.

pub mod config;
pub mod service;
