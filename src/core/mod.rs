pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod session;
pub mod shared;
pub mod store;
