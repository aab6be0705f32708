//! Identity and authorization boundary.
//!
//! Authentication happens outside the engine. Callers hand the orchestrator
//! an already-authenticated `Principal`; an `Authorizer` decides whether that
//! principal may perform an administrative action.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn operator(id: impl Into<String>) -> Self {
        Self::new(id, Role::Operator)
    }
}

/// Administrative operations subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    StartJob,
    StopJob,
    RecoverJobs,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::StartJob => "start_job",
            Action::StopJob => "stop_job",
            Action::RecoverJobs => "recover_jobs",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("principal '{principal}' is not allowed to {action}")]
pub struct AuthorizationError {
    pub principal: String,
    pub action: Action,
}

pub trait Authorizer: Send + Sync {
    fn authorize(&self, principal: &Principal, action: Action) -> Result<(), AuthorizationError>;
}

/// Grants every action to principals at or above `minimum`.
#[derive(Debug, Clone, Copy)]
pub struct RoleAuthorizer {
    minimum: Role,
}

impl RoleAuthorizer {
    pub fn new(minimum: Role) -> Self {
        Self { minimum }
    }
}

impl Default for RoleAuthorizer {
    fn default() -> Self {
        Self::new(Role::Operator)
    }
}

impl Authorizer for RoleAuthorizer {
    fn authorize(&self, principal: &Principal, action: Action) -> Result<(), AuthorizationError> {
        let required = match action {
            Action::RecoverJobs => self.minimum.max(Role::Operator),
            Action::StartJob | Action::StopJob => self.minimum,
        };
        if principal.role >= required {
            Ok(())
        } else {
            Err(AuthorizationError {
                principal: principal.id.clone(),
                action,
            })
        }
    }
}
