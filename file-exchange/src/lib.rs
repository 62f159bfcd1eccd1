//! File exchange server and client.
//!
//! Clients register a unique alias, list and transfer files held by the
//! server, and send direct or broadcast text messages. Each client holds two
//! TCP connections: a control channel for commands, replies and file bytes,
//! and a message channel on which the server pushes text asynchronously.
//!
//! - [`codec`] frames strings, lengths and raw byte spans.
//! - [`protocol`] names the commands, reply tokens and notice texts.
//! - [`store`] lists and opens files in a flat directory.
//! - [`registry`] maps aliases to message channels under a single lock and
//!   fans notices out.
//! - [`session`] runs the per-client command state machine.
//! - [`server`] accepts connection pairs and hands each one a session.
//! - [`client`] and [`input`] implement the `/command` terminal client.
//! - [`cli`] parses the command line for both modes.

pub mod cli;
pub mod client;
pub mod codec;
pub mod input;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
