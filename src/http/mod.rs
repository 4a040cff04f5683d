//! HTTP front end: the dispatch gate and the server that hosts it.

mod gate;
mod server;

pub use gate::{dispatch_gate, GateState, RATE_LIMITED_MESSAGE};
pub use server::HttpServer;
