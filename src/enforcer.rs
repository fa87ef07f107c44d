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

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::cache::RuleCache;
use crate::check::{Check, LeftHandSide};
use crate::checkers::{HttpCallout, NoHttpCallout};
use crate::config::EnforcerConfig;
use crate::error::{UnexpectedError, ValidationError};
use crate::parser::{parse_rule, SyntaxError};
use crate::request::{Attributes, Request};
use crate::ruleset::{DefaultRule, LoadError, RuleStore, ServiceRules};
use crate::storage::{Rule, StorageError, StorageGateway, StorageResult};

/// The credential attribute that names the domain of a tenant-scoped request.
pub const DOMAIN_ATTRIBUTE: &str = "scope.domain_id";

/// The rule that is added to every system service when a CSP domain is configured. It matches
/// callers whose [DOMAIN_ATTRIBUTE] is the CSP domain.
pub const CSP_DOMAIN_RULE: &str = "csp_domain";

/// Which rules apply to a decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Operator-level decisions. Only the system rules are consulted.
    System,
    /// Decisions within a tenant domain. The enabled custom policy of the domain is consulted
    /// first, then the tenant default rules.
    Tenant,
}

/// The operation that a decision is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action<'a> {
    pub service: &'a str,
    pub permission: &'a str,
}

impl<'a> Action<'a> {
    pub fn new(service: &'a str, permission: &'a str) -> Self {
        Action {
            service,
            permission,
        }
    }
}

impl fmt::Display for Action<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.permission)
    }
}

/// Returned by [Enforcer::authorize] when the policy does not allow the action.
///
/// Target and credentials are always available for auditing, but they only appear in the
/// error message if debug detail has been enabled.
#[derive(Error, Debug, Clone, PartialEq)]
pub struct NotAuthorized {
    service: String,
    permission: String,
    target: Attributes,
    credentials: Attributes,
    show_detail: bool,
}

impl NotAuthorized {
    fn new(action: Action<'_>, req: &Request<'_>, show_detail: bool) -> Self {
        NotAuthorized {
            service: action.service.to_owned(),
            permission: action.permission.to_owned(),
            target: req.target.clone(),
            credentials: req.credentials.clone(),
            show_detail,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn permission(&self) -> &str {
        &self.permission
    }

    pub fn target(&self) -> &Attributes {
        &self.target
    }

    pub fn credentials(&self) -> &Attributes {
        &self.credentials
    }
}

impl fmt::Display for NotAuthorized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.permission)?;
        if self.show_detail {
            let target = serde_json::to_string(&self.target).map_err(|_| fmt::Error)?;
            let credentials = serde_json::to_string(&self.credentials).map_err(|_| fmt::Error)?;
            write!(f, " on {target} by {credentials}")?;
        }
        f.write_str(" disallowed by policy")
    }
}

/// Error type for [Enforcer] operations.
#[derive(Error, Debug)]
pub enum EnforceError {
    /// Only returned when the caller asked for a failed decision to be raised.
    #[error(transparent)]
    NotAuthorized(#[from] NotAuthorized),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A stored tenant rule is not valid policy language. This is reported instead of being
    /// treated as either allow or deny.
    #[error("rule {service}:{permission} in policy {policy_id} is malformed: {source}")]
    MalformedRule {
        policy_id: String,
        service: String,
        permission: String,
        source: SyntaxError,
    },
}

/// Assembles an [Enforcer].
pub struct EnforcerBuilder {
    config: EnforcerConfig,
    system_rules: Option<RuleStore>,
    default_rules: Option<RuleStore>,
    storage: Option<Arc<dyn StorageGateway>>,
    http: Arc<dyn HttpCallout>,
}

impl EnforcerBuilder {
    pub fn new(config: EnforcerConfig) -> Self {
        EnforcerBuilder {
            config,
            system_rules: None,
            default_rules: None,
            storage: None,
            http: Arc::new(NoHttpCallout),
        }
    }

    /// Sets the rules for system-scoped decisions.
    #[must_use]
    pub fn system_rules(mut self, rules: RuleStore) -> Self {
        self.system_rules = Some(rules);
        self
    }

    /// Loads the system rules from a JSON document of the form `service -> permission -> rule`.
    /// The configured default rule name applies to them.
    pub fn system_rules_json(self, data: &str) -> Result<Self, LoadError> {
        let rules = RuleStore::from_json(data, Some(self.named_default()))?;
        Ok(self.system_rules(rules))
    }

    /// Sets the rules that apply to tenants without a matching custom rule.
    #[must_use]
    pub fn default_rules(mut self, rules: RuleStore) -> Self {
        self.default_rules = Some(rules);
        self
    }

    /// Like [EnforcerBuilder::system_rules_json], but for the tenant default rules.
    pub fn default_rules_json(self, data: &str) -> Result<Self, LoadError> {
        let rules = RuleStore::from_json(data, Some(self.named_default()))?;
        Ok(self.default_rules(rules))
    }

    /// Sets the gateway for tenant policies. Tenant-scoped decisions fail without one.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn StorageGateway>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the transport for `http:` and `https:` checks. By default, those checks always fail.
    #[must_use]
    pub fn http_callout(mut self, http: Arc<dyn HttpCallout>) -> Self {
        self.http = http;
        self
    }

    pub fn build(self) -> Result<Enforcer, LoadError> {
        let named_default = self.named_default();
        let mut system_rules = self
            .system_rules
            .unwrap_or_else(|| RuleStore::new(Some(named_default.clone())));
        let default_rules = self
            .default_rules
            .unwrap_or_else(|| RuleStore::new(Some(named_default)));

        if let Some(domain_id) = &self.config.csp_domain_id {
            let services: Vec<String> = system_rules.services().map(str::to_owned).collect();
            for service in services {
                if !system_rules.contains(&service, CSP_DOMAIN_RULE) {
                    let lhs = LeftHandSide::Identifier(DOMAIN_ATTRIBUTE.into());
                    system_rules.insert(&service, CSP_DOMAIN_RULE, Check::from_parts(lhs, domain_id));
                }
            }
        }
        system_rules.validate()?;
        default_rules.validate()?;

        Ok(Enforcer {
            cache: self.config.cache_rules.then(RuleCache::new),
            storage_timeout: self.config.storage_timeout(),
            debug: self.config.debug,
            system_rules,
            default_rules,
            storage: self.storage,
            http: self.http,
        })
    }

    fn named_default(&self) -> DefaultRule {
        DefaultRule::Named(self.config.default_rule.clone())
    }
}

/// Makes authorization decisions across the system, tenant-custom and tenant-default tiers.
///
/// An Enforcer is immutable after construction (except for its rule cache) and is meant to be
/// shared between concurrent requests, e.g. behind an `Arc`.
pub struct Enforcer {
    system_rules: RuleStore,
    default_rules: RuleStore,
    storage: Option<Arc<dyn StorageGateway>>,
    http: Arc<dyn HttpCallout>,
    cache: Option<RuleCache>,
    storage_timeout: Option<Duration>,
    debug: bool,
}

impl Enforcer {
    pub fn builder(config: EnforcerConfig) -> EnforcerBuilder {
        EnforcerBuilder::new(config)
    }

    pub fn system_rules(&self) -> &RuleStore {
        &self.system_rules
    }

    pub fn default_rules(&self) -> &RuleStore {
        &self.default_rules
    }

    /// Forgets cached rules of the given policy. Rules whose condition has changed are re-parsed
    /// anyway, so this is only needed to release memory, e.g. after a policy was deleted.
    pub fn invalidate_policy(&self, policy_id: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate_policy(policy_id);
        }
    }

    /// Decides whether the request may perform the action.
    ///
    /// A missing rule yields `Ok(false)`. Errors are only returned when no decision could be
    /// made: malformed requests, unknown domains, storage failures other than absence, and
    /// malformed stored rules.
    #[tracing::instrument(
        skip_all,
        fields(service = action.service, permission = action.permission, scope = ?scope)
    )]
    pub async fn enforce(
        &self,
        action: Action<'_>,
        req: &Request<'_>,
        scope: Scope,
    ) -> Result<bool, EnforceError> {
        match scope {
            Scope::System => Ok(self.evaluate_store(&self.system_rules, action, req)),
            Scope::Tenant => self.enforce_tenant(action, req).await,
        }
    }

    /// Like [Enforcer::enforce], but a negative decision is returned as
    /// [EnforceError::NotAuthorized].
    pub async fn authorize(
        &self,
        action: Action<'_>,
        req: &Request<'_>,
        scope: Scope,
    ) -> Result<(), EnforceError> {
        if self.enforce(action, req, scope).await? {
            Ok(())
        } else {
            Err(NotAuthorized::new(action, req, self.debug).into())
        }
    }

    /// Like [Enforcer::authorize], but a negative decision is turned into the caller's own error
    /// type by `deny`.
    pub async fn authorize_or_else<E, F>(
        &self,
        action: Action<'_>,
        req: &Request<'_>,
        scope: Scope,
        deny: F,
    ) -> Result<(), E>
    where
        E: From<EnforceError>,
        F: FnOnce(NotAuthorized) -> E,
    {
        if self.enforce(action, req, scope).await? {
            Ok(())
        } else {
            Err(deny(NotAuthorized::new(action, req, self.debug)))
        }
    }

    async fn enforce_tenant(&self, action: Action<'_>, req: &Request<'_>) -> Result<bool, EnforceError> {
        let domain_id = req.credentials.lookup_str(DOMAIN_ATTRIBUTE).ok_or_else(|| {
            ValidationError::MissingAttribute {
                attribute: DOMAIN_ATTRIBUTE.to_owned(),
                target: "credentials".to_owned(),
            }
        })?;
        let Some(storage) = self.storage.as_deref() else {
            let err = UnexpectedError::new("tenant-scoped decision requested, but no storage gateway is configured");
            return Err(self.surface(err.into()));
        };

        let policy = match self.with_deadline(storage.get_enabled_policy(&domain_id)).await {
            Ok(policy) => policy,
            Err(err) if falls_back(&err) => {
                tracing::warn!(domain_id = %domain_id, reason = %err, "no custom policy applies, using default rules");
                return Ok(self.evaluate_store(&self.default_rules, action, req));
            }
            Err(err) => return Err(self.surface(err)),
        };

        let lookup = storage.get_rule(&policy.id, action.service, action.permission);
        let rule = match self.with_deadline(lookup).await {
            Ok(rule) => rule,
            Err(err) if falls_back(&err) => {
                tracing::warn!(policy_id = %policy.id, reason = %err, "no custom rule applies, using default rules");
                return Ok(self.evaluate_store(&self.default_rules, action, req));
            }
            Err(err) => return Err(self.surface(err)),
        };

        tracing::debug!(policy_id = %policy.id, rule_id = %rule.id, "evaluating custom rule");
        let check = self.parse_stored(&rule)?;
        //stored rules cannot reference other rules, so `rule:` checks within them deny
        Ok(check.evaluate_with_callout(req, ServiceRules::empty(), self.http.as_ref()))
    }

    fn evaluate_store(&self, rules: &RuleStore, action: Action<'_>, req: &Request<'_>) -> bool {
        match rules.evaluate_with_callout(action.service, action.permission, req, self.http.as_ref()) {
            Ok(result) => result,
            Err(err) => {
                tracing::debug!("{err}, denying");
                false
            }
        }
    }

    fn parse_stored(&self, rule: &Rule) -> Result<Arc<Check>, EnforceError> {
        let parsed = match &self.cache {
            Some(cache) => cache.get_or_parse(&rule.policy_id, &rule.service, &rule.permission, &rule.condition),
            None => parse_rule(&rule.condition).map(Arc::new),
        };
        parsed.map_err(|source| EnforceError::MalformedRule {
            policy_id: rule.policy_id.clone(),
            service: rule.service.clone(),
            permission: rule.permission.clone(),
            source,
        })
    }

    async fn with_deadline<T>(&self, lookup: impl Future<Output = StorageResult<T>>) -> StorageResult<T> {
        match self.storage_timeout {
            Some(limit) => tokio::time::timeout(limit, lookup)
                .await
                .unwrap_or(Err(StorageError::Timeout(limit))),
            None => lookup.await,
        }
    }

    fn surface(&self, err: StorageError) -> EnforceError {
        match err {
            StorageError::Unexpected(inner) => {
                tracing::warn!(detail = inner.detail(), "storage lookup failed");
                StorageError::Unexpected(inner.with_detail_shown(self.debug)).into()
            }
            other => other.into(),
        }
    }
}

/// Whether a storage error means that no custom rule applies, so that the tenant default rules
/// decide instead.
fn falls_back(err: &StorageError) -> bool {
    matches!(
        err,
        StorageError::PolicyNotFound(_) | StorageError::RuleNotFound { .. } | StorageError::Timeout(_)
    )
}
