pub mod audit;
pub mod policy;
pub mod prompt_firewall;
pub mod webhook;
