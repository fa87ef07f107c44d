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

//! A multi-tenant policy engine for rules in the [oslo.policy][oslo] language.
//!
//! Rules look like `role:admin or (role:member and project_id:%(target.project_id)s)`. They are
//! parsed into [Check] trees and evaluated against a [Request] made of credential and target
//! [Attributes].
//!
//! Decisions are made by an [Enforcer], which consults one of three tiers:
//!
//! - system rules, for operator-level decisions ([Scope::System]),
//! - the enabled custom policy of the caller's domain, read through a [StorageGateway],
//! - the tenant default rules, whenever the domain has no custom rule for the action.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use tenant_policy::{Action, Attributes, Enforcer, EnforcerConfig, Request, Scope};
//! use tenant_policy::storage::memory::MemoryGateway;
//!
//! let enforcer = Enforcer::builder(EnforcerConfig::default())
//!     .default_rules_json(r#"{"keystone": {"get_domain": "role:reader"}}"#)?
//!     .storage(Arc::new(MemoryGateway::new()))
//!     .build()?;
//!
//! let credentials = Attributes::new()
//!     .with("scope.domain_id", "d-1")
//!     .with("roles", vec!["reader"]);
//! let req = Request::new(&credentials);
//! enforcer
//!     .authorize(Action::new("keystone", "get_domain"), &req, Scope::Tenant)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! [oslo]: https://docs.openstack.org/oslo.policy/latest/admin/policy-json-file.html

pub mod cache;
mod check;
mod checkers;
pub mod config;
pub mod enforcer;
pub mod error;
mod parser;
mod request;
mod ruleset;
pub mod storage;

pub use check::{Check, LeftHandSide, Template, Unresolved};
pub use checkers::{CalloutError, HttpCallout, NoHttpCallout};
pub use config::EnforcerConfig;
pub use enforcer::{Action, EnforceError, Enforcer, EnforcerBuilder, NotAuthorized, Scope};
pub use parser::{parse_list_rule, parse_rule, LegacyGroup, RuleText, SyntaxError};
pub use request::{Attributes, Request, ROLES_ATTRIBUTE};
pub use ruleset::{
    DefaultRule, LoadError, ParseError, RuleNotFound, RuleStore, RuleTables, ServiceRules,
};
pub use storage::{StorageError, StorageGateway};
