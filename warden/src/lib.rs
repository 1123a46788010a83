//! warden: plugin orchestration daemon
//!
//! The `wardend` binary is a thin shell around [`warden_host`]: flags in
//! [`cli`], logging in [`tracing_support`], the run loop in [`daemon`].

pub mod cli;
pub mod daemon;
pub mod tracing_support;

pub use cli::Cli;
