//! Live H.264 camera streaming over RTP.
//!
//! The `stream` module holds the pipeline stages and their contracts; the
//! `config` module persists stream defaults. The `camstream` binary wires
//! them to the command line.

pub mod config;
pub mod stream;
