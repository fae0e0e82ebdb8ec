//! Per-request session context bound to one unit of work.
//!
//! A [`SessionContext`] is installed on exactly one store connection by the
//! gateway and cleared when that connection is released. It is never
//! inherited implicitly: background work receives a [`ContextSnapshot`] and
//! installs it on its own connection.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::core::error::GovernanceError;

/// Runtime parameter read by the row-filter predicates for the tenant.
pub const PARAM_CURRENT_ORG: &str = "app.current_org";
/// Runtime parameter holding the acting user.
pub const PARAM_CURRENT_USER: &str = "app.current_user";
/// Runtime parameter holding the acting role.
pub const PARAM_CURRENT_ROLE: &str = "app.current_role";

pub const SESSION_PARAMETERS: [&str; 3] = [PARAM_CURRENT_ORG, PARAM_CURRENT_USER, PARAM_CURRENT_ROLE];

pub const HEADER_ORGANIZATION_ID: &str = "x-organization-id";
pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_USER_ROLE: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Agent,
    Customer,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Agent => "agent",
            Self::Customer => "customer",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown role '{}'", self.0)
    }
}

impl std::error::Error for UnknownRole {}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "manager" => Ok(Self::Manager),
            "agent" => Ok(Self::Agent),
            "customer" => Ok(Self::Customer),
            "system" => Ok(Self::System),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Identity and request metadata for one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub request_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl SessionContext {
    pub fn new(organization_id: Uuid, user_id: Uuid, role: Role) -> Self {
        Self {
            organization_id,
            user_id,
            role,
            request_ip: None,
            user_agent: None,
        }
    }

    pub fn with_client_info(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.request_ip = ip;
        self.user_agent = user_agent;
        self
    }

    /// Values written to the connection's runtime parameters, in install order.
    pub fn parameters(&self) -> [(&'static str, String); 3] {
        [
            (PARAM_CURRENT_ORG, self.organization_id.to_string()),
            (PARAM_CURRENT_USER, self.user_id.to_string()),
            (PARAM_CURRENT_ROLE, self.role.as_str().to_string()),
        ]
    }

    /// Context forwarded by the authenticating proxy. The `system` role is
    /// reserved for background work and never accepted from a request.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, GovernanceError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let organization_id = header(HEADER_ORGANIZATION_ID)
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or(GovernanceError::ContextMissing)?;
        let user_id = header(HEADER_USER_ID)
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or(GovernanceError::ContextMissing)?;
        let role = header(HEADER_USER_ROLE)
            .and_then(|v| v.parse::<Role>().ok())
            .filter(|r| *r != Role::System)
            .ok_or(GovernanceError::ContextMissing)?;

        let request_ip = header("x-forwarded-for")
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
            .or_else(|| header("x-real-ip").map(str::to_string));
        let user_agent = header("user-agent").map(str::to_string);

        Ok(Self::new(organization_id, user_id, role).with_client_info(request_ip, user_agent))
    }

    /// Explicit copy handed to a spawned task.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            context: self.clone(),
            captured_at: Utc::now(),
        }
    }
}

/// Immutable copy of a [`SessionContext`] taken at spawn time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    context: SessionContext,
    captured_at: DateTime<Utc>,
}

impl ContextSnapshot {
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn organization_id(&self) -> Uuid {
        self.context.organization_id
    }

    /// Same tenant and actor, acting with the `system` role. Background jobs
    /// (webhook bookkeeping, run finalisation) write rows the original role
    /// may not be allowed to touch.
    pub fn for_background(&self) -> Self {
        let mut context = self.context.clone();
        context.role = Role::System;
        Self {
            context,
            captured_at: self.captured_at,
        }
    }

    pub fn into_context(self) -> SessionContext {
        self.context
    }
}

/// What the store reports back for the three runtime parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextReadback {
    pub org_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub role: Option<Role>,
    pub is_set: bool,
}

impl ContextReadback {
    pub fn unset() -> Self {
        Self {
            org_id: None,
            user_id: None,
            role: None,
            is_set: false,
        }
    }

    /// Builds a readback from raw parameter values. Empty strings count as
    /// unset because clearing a setting leaves an empty value behind.
    pub fn from_raw(org: Option<&str>, user: Option<&str>, role: Option<&str>) -> Self {
        let org_id = non_empty(org).and_then(|v| Uuid::parse_str(v).ok());
        let user_id = non_empty(user).and_then(|v| Uuid::parse_str(v).ok());
        let role = non_empty(role).and_then(|v| v.parse::<Role>().ok());
        let is_set = org_id.is_some() && user_id.is_some() && role.is_some();
        Self {
            org_id,
            user_id,
            role,
            is_set,
        }
    }

    pub fn matches(&self, context: &SessionContext) -> bool {
        self.is_set
            && self.org_id == Some(context.organization_id)
            && self.user_id == Some(context.user_id)
            && self.role == Some(context.role)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
