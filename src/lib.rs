//! scriptd library
//!
//! A remote script-execution server:
//! - Line-delimited JSON command protocol over a local control socket and TCP
//! - Compile-then-load pipeline for Rhai sources with sibling units
//! - Cross-process method calls over named local sockets
//! - Supervisor with restart and exit

pub mod capability;
pub mod compiler;
pub mod config;
pub mod rpc;
pub mod script;
pub mod server;
pub mod shell;
pub mod transport;
