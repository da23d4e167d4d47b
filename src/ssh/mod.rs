// ABOUTME: Gateway transport and the channels multiplexed over it.
// ABOUTME: Shell, SOCKS proxy, port forwarding and file copy all share one Session.

mod client;
mod copy;
mod forward;
mod shell;
pub mod socks;
mod splice;
mod state;

pub use client::{Session, SessionOptions};
pub use forward::{ForwardHandle, ForwardStats};
pub use shell::{ShellChannel, ShellExit, ShellRequest, TerminalSize};
pub use splice::{SpliceEnd, SpliceOutcome, splice};
pub use state::SessionState;
