//! Internal HTTP surface and server lifecycle.

mod health;
mod server;

pub use health::*;
pub use server::*;
