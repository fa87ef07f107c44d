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

//! In-memory implementation of [StorageGateway].
//!
//! All state lives in `HashMap`s behind a single `tokio::sync::RwLock` and is lost when the
//! gateway is dropped. This is meant for tests, local development and deployments that provision
//! tenant policies at startup.
//!
//! Writes enforce the same constraints as a relational schema would: column length limits,
//! uniqueness of policy names per domain and of rules per (policy, service, permission), and at
//! most one enabled policy per domain.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{Domain, Policy, Rule, StorageError, StorageGateway, StorageResult};
use crate::error::ValidationError;

/// Length limit for IDs and names.
const NAME_LENGTH: usize = 64;
/// Length limit for service and permission names.
const ACTION_LENGTH: usize = 255;

type RuleKey = (String, String, String);

#[derive(Debug, Default)]
struct State {
    domains: HashMap<String, Domain>,
    policies: HashMap<String, Policy>,
    rules: HashMap<RuleKey, Rule>,
}

impl State {
    fn enabled_policy(&self, domain_id: &str) -> Option<&Policy> {
        self.policies
            .values()
            .find(|p| p.enabled && p.domain_id == domain_id)
    }

    fn ensure_single_enabled(&self, policy: &Policy) -> StorageResult<()> {
        if !policy.enabled {
            return Ok(());
        }
        match self.enabled_policy(&policy.domain_id) {
            Some(other) if other.id != policy.id => Err(StorageError::Conflict {
                kind: "policy".into(),
                details: format!(
                    "domain {} already has the enabled policy {}",
                    policy.domain_id, other.id
                ),
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: RwLock<State>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_domain(&self, domain: Domain) -> StorageResult<Domain> {
        check_length("id", &domain.id, NAME_LENGTH)?;
        check_length("name", &domain.name, NAME_LENGTH)?;

        let mut state = self.state.write().await;
        let duplicate = state
            .domains
            .values()
            .any(|d| d.id == domain.id || d.name == domain.name);
        if duplicate {
            return Err(conflict("domain", format!("duplicate ID or name {:?}", domain.name)));
        }
        state.domains.insert(domain.id.clone(), domain.clone());
        Ok(domain)
    }

    pub async fn create_policy(&self, policy: Policy) -> StorageResult<Policy> {
        check_length("id", &policy.id, NAME_LENGTH)?;
        check_length("name", &policy.name, NAME_LENGTH)?;
        check_length("domain_id", &policy.domain_id, NAME_LENGTH)?;

        let mut state = self.state.write().await;
        if !state.domains.contains_key(&policy.domain_id) {
            return Err(StorageError::DomainNotFound {
                domain_id: policy.domain_id,
            });
        }
        let duplicate = state.policies.values().any(|p| {
            p.id == policy.id || (p.domain_id == policy.domain_id && p.name == policy.name)
        });
        if duplicate {
            return Err(conflict("policy", format!("duplicate ID or name {:?}", policy.name)));
        }
        state.ensure_single_enabled(&policy)?;
        state.policies.insert(policy.id.clone(), policy.clone());
        Ok(policy)
    }

    pub async fn get_policy(&self, policy_id: &str) -> StorageResult<Policy> {
        let state = self.state.read().await;
        state
            .policies
            .get(policy_id)
            .cloned()
            .ok_or_else(|| StorageError::PolicyNotFound(policy_id.to_owned()))
    }

    /// Enables or disables a policy. Enabling fails with a conflict while another policy of the
    /// same domain is enabled.
    pub async fn set_policy_enabled(&self, policy_id: &str, enabled: bool) -> StorageResult<Policy> {
        let mut state = self.state.write().await;
        let Some(policy) = state.policies.get(policy_id) else {
            return Err(StorageError::PolicyNotFound(policy_id.to_owned()));
        };
        let updated = Policy {
            enabled,
            ..policy.clone()
        };
        state.ensure_single_enabled(&updated)?;
        state.policies.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    pub async fn create_rule(&self, rule: Rule) -> StorageResult<Rule> {
        check_length("id", &rule.id, NAME_LENGTH)?;
        check_length("policy_id", &rule.policy_id, NAME_LENGTH)?;
        check_length("service", &rule.service, ACTION_LENGTH)?;
        check_length("permission", &rule.permission, ACTION_LENGTH)?;

        let mut state = self.state.write().await;
        if !state.policies.contains_key(&rule.policy_id) {
            return Err(StorageError::PolicyNotFound(rule.policy_id));
        }
        let key = rule_key(&rule.policy_id, &rule.service, &rule.permission);
        if state.rules.contains_key(&key) || state.rules.values().any(|r| r.id == rule.id) {
            return Err(conflict(
                "rule",
                format!("duplicate rule {}:{} in policy {}", rule.service, rule.permission, rule.policy_id),
            ));
        }
        state.rules.insert(key, rule.clone());
        Ok(rule)
    }

    /// Replaces the condition of an existing rule.
    pub async fn update_rule(
        &self,
        policy_id: &str,
        service: &str,
        permission: &str,
        condition: impl Into<String>,
    ) -> StorageResult<Rule> {
        let mut state = self.state.write().await;
        let rule = state
            .rules
            .get_mut(&rule_key(policy_id, service, permission))
            .ok_or_else(|| rule_not_found(policy_id, service, permission))?;
        rule.condition = condition.into();
        Ok(rule.clone())
    }

    pub async fn delete_rule(
        &self,
        policy_id: &str,
        service: &str,
        permission: &str,
    ) -> StorageResult<Rule> {
        let mut state = self.state.write().await;
        state
            .rules
            .remove(&rule_key(policy_id, service, permission))
            .ok_or_else(|| rule_not_found(policy_id, service, permission))
    }
}

#[async_trait]
impl StorageGateway for MemoryGateway {
    async fn get_enabled_policy(&self, domain_id: &str) -> StorageResult<Policy> {
        let state = self.state.read().await;
        if !state.domains.contains_key(domain_id) {
            return Err(StorageError::DomainNotFound {
                domain_id: domain_id.to_owned(),
            });
        }
        state
            .enabled_policy(domain_id)
            .cloned()
            .ok_or_else(|| StorageError::PolicyNotFound(format!("enabled policy in domain {domain_id}")))
    }

    async fn get_rule(
        &self,
        policy_id: &str,
        service: &str,
        permission: &str,
    ) -> StorageResult<Rule> {
        let state = self.state.read().await;
        state
            .rules
            .get(&rule_key(policy_id, service, permission))
            .cloned()
            .ok_or_else(|| rule_not_found(policy_id, service, permission))
    }
}

fn rule_key(policy_id: &str, service: &str, permission: &str) -> RuleKey {
    (policy_id.to_owned(), service.to_owned(), permission.to_owned())
}

fn rule_not_found(policy_id: &str, service: &str, permission: &str) -> StorageError {
    StorageError::RuleNotFound {
        policy_id: policy_id.to_owned(),
        service: service.to_owned(),
        permission: permission.to_owned(),
    }
}

fn conflict(kind: &str, details: String) -> StorageError {
    StorageError::Conflict {
        kind: kind.to_owned(),
        details,
    }
}

fn check_length(column: &str, value: &str, length: usize) -> StorageResult<()> {
    if value.chars().count() > length {
        return Err(ValidationError::StringLengthExceeded {
            string: value.to_owned(),
            column: column.to_owned(),
            length,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(id: &str) -> Domain {
        Domain {
            id: id.into(),
            name: format!("{id}-name"),
            enabled: true,
            description: None,
        }
    }

    fn policy(id: &str, domain_id: &str, enabled: bool) -> Policy {
        Policy {
            id: id.into(),
            name: format!("{id}-name"),
            domain_id: domain_id.into(),
            enabled,
            description: None,
        }
    }

    fn rule(id: &str, policy_id: &str, permission: &str, condition: &str) -> Rule {
        Rule {
            id: id.into(),
            policy_id: policy_id.into(),
            service: "keystone".into(),
            permission: permission.into(),
            condition: condition.into(),
        }
    }

    #[tokio::test]
    async fn test_enabled_policy_lookup() {
        let gw = MemoryGateway::new();
        gw.create_domain(domain("d1")).await.unwrap();
        gw.create_domain(domain("d2")).await.unwrap();
        gw.create_policy(policy("p1", "d1", true)).await.unwrap();
        gw.create_policy(policy("p2", "d2", false)).await.unwrap();

        assert_eq!(gw.get_enabled_policy("d1").await.unwrap().id, "p1");
        assert!(matches!(
            gw.get_enabled_policy("d2").await,
            Err(StorageError::PolicyNotFound(_))
        ));
        assert_eq!(
            gw.get_enabled_policy("d3").await,
            Err(StorageError::DomainNotFound {
                domain_id: "d3".into()
            })
        );

        gw.set_policy_enabled("p2", true).await.unwrap();
        assert_eq!(gw.get_enabled_policy("d2").await.unwrap().id, "p2");
        assert!(gw.get_policy("p2").await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_at_most_one_enabled_policy_per_domain() {
        let gw = MemoryGateway::new();
        gw.create_domain(domain("d1")).await.unwrap();
        gw.create_policy(policy("p1", "d1", true)).await.unwrap();

        let result = gw.create_policy(policy("p2", "d1", true)).await;
        assert!(matches!(result, Err(StorageError::Conflict { .. })));

        gw.create_policy(policy("p2", "d1", false)).await.unwrap();
        let result = gw.set_policy_enabled("p2", true).await;
        assert!(matches!(result, Err(StorageError::Conflict { .. })));

        //switching over works by disabling first
        gw.set_policy_enabled("p1", false).await.unwrap();
        gw.set_policy_enabled("p2", true).await.unwrap();
        assert_eq!(gw.get_enabled_policy("d1").await.unwrap().id, "p2");
        //re-enabling the enabled policy is not a conflict with itself
        gw.set_policy_enabled("p2", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_rules() {
        let gw = MemoryGateway::new();
        gw.create_domain(domain("d1")).await.unwrap();
        gw.create_policy(policy("p1", "d1", true)).await.unwrap();
        gw.create_rule(rule("r1", "p1", "get_domain", "role:domain_admin"))
            .await
            .unwrap();

        let found = gw.get_rule("p1", "keystone", "get_domain").await.unwrap();
        assert_eq!(found.condition, "role:domain_admin");
        assert!(matches!(
            gw.get_rule("p1", "keystone", "list_domains").await,
            Err(StorageError::RuleNotFound { .. })
        ));

        let result = gw.create_rule(rule("r2", "p1", "get_domain", "@")).await;
        assert!(matches!(result, Err(StorageError::Conflict { .. })));
        let result = gw.create_rule(rule("r1", "p1", "list_domains", "@")).await;
        assert!(matches!(result, Err(StorageError::Conflict { .. })));
        let result = gw.create_rule(rule("r3", "p9", "get_domain", "@")).await;
        assert_eq!(result, Err(StorageError::PolicyNotFound("p9".into())));

        let updated = gw.update_rule("p1", "keystone", "get_domain", "@").await.unwrap();
        assert_eq!(updated.condition, "@");
        gw.delete_rule("p1", "keystone", "get_domain").await.unwrap();
        assert!(gw.get_rule("p1", "keystone", "get_domain").await.is_err());
        assert!(gw.delete_rule("p1", "keystone", "get_domain").await.is_err());
    }

    #[tokio::test]
    async fn test_validation() {
        let gw = MemoryGateway::new();
        let long_id = "x".repeat(NAME_LENGTH + 1);
        let result = gw.create_domain(domain(&long_id)).await;
        assert!(matches!(
            result,
            Err(StorageError::Validation(ValidationError::StringLengthExceeded { length: NAME_LENGTH, .. }))
        ));

        let result = gw.create_policy(policy("p1", "nope", false)).await;
        assert!(matches!(result, Err(StorageError::DomainNotFound { .. })));

        gw.create_domain(domain("d1")).await.unwrap();
        let result = gw.create_domain(domain("d1")).await;
        assert!(matches!(result, Err(StorageError::Conflict { .. })));
        gw.create_policy(policy("p1", "d1", false)).await.unwrap();
        let mut same_name = policy("p2", "d1", false);
        same_name.name = "p1-name".into();
        let result = gw.create_policy(same_name).await;
        assert!(matches!(result, Err(StorageError::Conflict { .. })));
    }
}
