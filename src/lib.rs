// ABOUTME: Library root for dyno-exec - remote shell, SOCKS proxy and port forwarding into dynos.
// ABOUTME: The main binary is in main.rs.

pub mod commands;
pub mod config;
pub mod control;
pub mod diagnostics;
pub mod error;
pub mod ssh;
pub mod status;
pub mod types;
