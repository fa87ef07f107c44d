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

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::check::Check;
use crate::checkers::{Evaluation, HttpCallout, NoHttpCallout};
use crate::parser::{RuleText, SyntaxError};
use crate::request::Request;

/// Rule tables in their serialized form: `service -> permission -> rule`.
pub type RuleTables = HashMap<String, HashMap<String, RuleText>>;

/// What to use when a permission has no rule of its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DefaultRule {
    /// Use the rule with this name from the same service, if there is one.
    Named(String),
    /// Use this check.
    Check(Check),
}

/// A container for policy rules, grouped by service.
///
/// Rules are looked up by service and permission. If a service has no rule for some permission,
/// the [DefaultRule] applies, if one is configured.
#[derive(Clone, Debug, Default)]
pub struct RuleStore {
    services: HashMap<String, HashMap<String, Check>>,
    default_rule: Option<DefaultRule>,
}

impl RuleStore {
    /// Returns a new empty RuleStore.
    pub fn new(default_rule: Option<DefaultRule>) -> Self {
        Self {
            services: HashMap::new(),
            default_rule,
        }
    }

    /// Parses a set of rule tables. Fails if any rule does not parse, or if the default rule
    /// redirects in a circle (see [RuleStore::validate]).
    pub fn from_tables(
        tables: RuleTables,
        default_rule: Option<DefaultRule>,
    ) -> Result<Self, LoadError> {
        let mut store = Self::new(default_rule);
        for (service, rules) in tables {
            for (permission, text) in rules {
                let check = text.parse().map_err(|error| ParseError {
                    rule_name: format!("{service}:{permission}"),
                    error,
                })?;
                store.insert(&service, permission, check);
            }
        }
        store.validate()?;
        Ok(store)
    }

    /// Like [RuleStore::from_tables], but reads the rule tables from a JSON document.
    pub fn from_json(data: &str, default_rule: Option<DefaultRule>) -> Result<Self, LoadError> {
        let tables: RuleTables = serde_json::from_str(data)?;
        Self::from_tables(tables, default_rule)
    }

    /// Parses a single rule and adds it to this RuleStore.
    pub fn add_rule(
        &mut self,
        service: &str,
        permission: impl Into<String>,
        text: &str,
    ) -> Result<(), ParseError> {
        let permission = permission.into();
        match crate::parser::parse_rule(text) {
            Ok(check) => {
                self.insert(service, permission, check);
                Ok(())
            }
            Err(error) => Err(ParseError {
                rule_name: format!("{service}:{permission}"),
                error,
            }),
        }
    }

    /// Adds an already parsed rule to this RuleStore.
    pub fn insert(&mut self, service: &str, permission: impl Into<String>, check: Check) {
        self.services
            .entry(service.to_owned())
            .or_default()
            .insert(permission.into(), check);
    }

    pub fn default_rule(&self) -> Option<&DefaultRule> {
        self.default_rule.as_ref()
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Returns the rules of a single service. Unknown services yield an empty rule set that
    /// still applies the default rule.
    pub fn service(&self, service: &str) -> ServiceRules<'_> {
        ServiceRules {
            rules: self.services.get(service),
            default_rule: self.default_rule.as_ref(),
        }
    }

    /// Whether the service has a rule of its own for this permission. The default rule is not
    /// considered.
    pub fn contains(&self, service: &str, permission: &str) -> bool {
        self.services
            .get(service)
            .is_some_and(|rules| rules.contains_key(permission))
    }

    /// Finds the rule for the given service and permission, falling back to the default rule.
    pub fn lookup(&self, service: &str, permission: &str) -> Result<&Check, RuleNotFound> {
        self.service(service)
            .get(permission)
            .ok_or_else(|| RuleNotFound {
                service: service.to_owned(),
                permission: permission.to_owned(),
            })
    }

    /// Evaluates the rule for the given service and permission.
    pub fn evaluate(
        &self,
        service: &str,
        permission: &str,
        req: &Request<'_>,
    ) -> Result<bool, RuleNotFound> {
        self.evaluate_with_callout(service, permission, req, &NoHttpCallout)
    }

    /// Like [RuleStore::evaluate], but HTTP checks are delegated to `http`.
    pub fn evaluate_with_callout(
        &self,
        service: &str,
        permission: &str,
        req: &Request<'_>,
        http: &dyn HttpCallout,
    ) -> Result<bool, RuleNotFound> {
        //resolve upfront, so that a missing rule is reported instead of being evaluated as false
        self.lookup(service, permission)?;
        Ok(Evaluation::new(req, self.service(service), http).check_rule(permission))
    }

    /// Checks that following the default rule can never lead back to itself.
    ///
    /// A named default that resolves to a plain `rule:` reference to a missing permission would
    /// otherwise bounce between the reference and the default forever.
    pub fn validate(&self) -> Result<(), LoadError> {
        let Some(DefaultRule::Named(default_name)) = &self.default_rule else {
            return Ok(());
        };
        for (service, rules) in &self.services {
            let mut chain = vec![default_name.as_str()];
            let mut current = rules.get(default_name.as_str());
            while let Some(Check::Rule(next)) = current {
                let next = if rules.contains_key(next) {
                    next.as_str()
                } else {
                    default_name.as_str()
                };
                if chain.contains(&next) {
                    chain.push(next);
                    return Err(LoadError::DefaultRuleCycle {
                        service: service.clone(),
                        chain: chain.join(" -> "),
                    });
                }
                chain.push(next);
                current = rules.get(next);
            }
        }
        Ok(())
    }

    /// Dumps the rules as a JSON document of the form `service -> permission -> rule`. Rules that
    /// always pass are written as the empty string.
    pub fn to_json(&self) -> serde_json::Value {
        let tables: BTreeMap<&str, BTreeMap<&str, String>> = self
            .services
            .iter()
            .map(|(service, rules)| {
                let rules = rules
                    .iter()
                    .map(|(permission, check)| {
                        let text = match check {
                            Check::Const(true) => String::new(),
                            check => check.to_string(),
                        };
                        (permission.as_str(), text)
                    })
                    .collect();
                (service.as_str(), rules)
            })
            .collect();
        serde_json::json!(tables)
    }
}

/// The rules of a single service within a [RuleStore]. This is the rule set that `rule:` checks
/// are resolved against.
#[derive(Clone, Copy, Debug)]
pub struct ServiceRules<'a> {
    rules: Option<&'a HashMap<String, Check>>,
    default_rule: Option<&'a DefaultRule>,
}

impl<'a> ServiceRules<'a> {
    /// A rule set without any rules and without a default rule. Every `rule:` check fails.
    pub fn empty() -> Self {
        ServiceRules {
            rules: None,
            default_rule: None,
        }
    }

    /// Finds the rule for the given permission.
    ///
    /// - If the rule exists, it is returned.
    /// - Otherwise, if the default rule is a check, that check is returned.
    /// - Otherwise, if the default rule names an existing rule, that rule is returned.
    /// - Otherwise, `None` is returned.
    pub fn get(&self, permission: &str) -> Option<&'a Check> {
        if let Some(check) = self.find(permission) {
            return Some(check);
        }
        match self.default_rule {
            Some(DefaultRule::Check(check)) => Some(check),
            //only one level of redirection, so that a missing default cannot recurse
            Some(DefaultRule::Named(name)) => self.find(name),
            None => None,
        }
    }

    fn find(&self, permission: &str) -> Option<&'a Check> {
        self.rules.and_then(|rules| rules.get(permission))
    }
}

/// Error type returned when neither a rule nor a usable default rule exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no rule for {service}:{permission} and no usable default rule")]
pub struct RuleNotFound {
    pub service: String,
    pub permission: String,
}

///Error type returned by [RuleStore::add_rule].
///
///This type hides the internal error type that the policy language parser returns.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("could not parse rule {rule_name:?}: {error}")]
pub struct ParseError {
    rule_name: String,
    error: SyntaxError,
}

impl ParseError {
    pub fn rule_name(&self) -> &str {
        &self.rule_name
    }
}

/// Error type returned when loading rule tables.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("could not decode rule tables: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("default rule of service {service:?} redirects in a circle: {chain}")]
    DefaultRuleCycle { service: String, chain: String },
}
