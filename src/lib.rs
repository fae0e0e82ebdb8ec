//! Tenant isolation, audit trail and AI governance for the help-desk backend.

pub mod core;
pub mod llm;
pub mod main_module;
pub mod security;
pub mod tickets;

pub use crate::core::error::GovernanceError;
pub use crate::core::gateway::{TenantGateway, UnitOfWork};
pub use crate::core::session::{ContextSnapshot, Role, SessionContext};
