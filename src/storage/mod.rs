/******************************************************************************
*
*  Copyright 2023 Stefan Majewsky <majewsky@gmx.net>
*
*  Licensed under the Apache License, Version 2.0 (the "License");
*  you may not use this file except in compliance with the License.
*  You may obtain a copy of the License at
*
*      http://www.apache.org/licenses/LICENSE-2.0
*
*  Unless required by applicable law or agreed to in writing, software
*  distributed under the License is distributed on an "AS IS" BASIS,
*  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
*  See the License for the specific language governing permissions and
*  limitations under the License.
*
******************************************************************************/

//! Access to tenant-specific policies.
//!
//! The [Enforcer][crate::Enforcer] only reads through the [StorageGateway] trait. Each call is a
//! self-contained lookup; implementations must not share session state between calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::error::{UnexpectedError, ValidationError};

pub mod memory;

/// A tenant domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// A named set of custom rules belonging to a domain. At most one policy per domain is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub domain_id: String,
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// The rule text of one permission within a [Policy]. Unique per (policy_id, service, permission).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub policy_id: String,
    pub service: String,
    pub permission: String,
    /// A rule in the policy language.
    pub condition: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("could not find domain: {domain_id}")]
    DomainNotFound { domain_id: String },
    /// No policy with this ID, or no enabled policy in this domain.
    #[error("could not find policy: {0}")]
    PolicyNotFound(String),
    #[error("could not find rule: policy({policy_id}), service({service}), permission({permission})")]
    RuleNotFound {
        policy_id: String,
        service: String,
        permission: String,
    },
    #[error("could not find role: {role_id}")]
    RoleNotFound { role_id: String },
    #[error("could not find role assignment with role: {role_id}, user or group: {actor_id}, project or domain: {target_id}")]
    RoleAssignmentNotFound {
        role_id: String,
        actor_id: String,
        target_id: String,
    },
    #[error("conflict occurred attempting to store {kind}: {details}")]
    Conflict { kind: String, details: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("storage lookup did not finish within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Unexpected(#[from] UnexpectedError),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Read access to tenant policies, as needed by the [Enforcer][crate::Enforcer].
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Returns the enabled policy of the given domain.
    ///
    /// Fails with [StorageError::DomainNotFound] if the domain does not exist, and with
    /// [StorageError::PolicyNotFound] if the domain exists, but has no enabled policy.
    async fn get_enabled_policy(&self, domain_id: &str) -> StorageResult<Policy>;

    /// Returns the rule for the given service and permission within the given policy, or
    /// [StorageError::RuleNotFound].
    async fn get_rule(
        &self,
        policy_id: &str,
        service: &str,
        permission: &str,
    ) -> StorageResult<Rule>;
}
