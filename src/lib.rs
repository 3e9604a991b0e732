#[macro_use]
extern crate tracing;

pub mod cli;
pub mod decoder;
pub mod depacketizer;
pub mod frame;
pub mod gate;
pub mod peer;
pub mod session;
pub mod settings;
pub mod signaling;
pub mod ticker;
pub mod trace;
pub mod writer;
