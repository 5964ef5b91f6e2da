//! Transport: length-delimited JSON frames over TCP, the typed control
//! frames, and the client/server endpoints built on them.

pub mod client;
pub mod server;
pub mod wire;
