//! Hardware-independent core library for zerowatch
//!
//! This crate contains the device control plane: the provisioning store that
//! holds network and backend credentials, the uptime-derived authorization
//! code that gates destructive commands, the command/response protocol that
//! runs over the shared key-value store, and remote configuration sync.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32) and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod app_state;
pub mod command;
pub mod config;
pub mod otp;
pub mod provisioning;
pub mod store;
pub mod telemetry;
