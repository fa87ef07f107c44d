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

use serde::Serialize;
use serde_json::Value;

use crate::check::{Check, LeftHandSide, Template};
use crate::request::{render_value, Attributes, Request};
use crate::ruleset::ServiceRules;

/// The capability behind `http:` and `https:` checks.
///
/// The rendered URL is passed along with a JSON document of the form
/// `{"target": {...}, "credentials": {...}}`. The check passes only if this returns `Ok(true)`;
/// any error counts as a failed check.
pub trait HttpCallout: Send + Sync {
    /// Asks the remote server at `url` whether the request is allowed.
    fn invoke(&self, url: &str, payload: &str) -> Result<bool, CalloutError>;
}

/// Error type for [HttpCallout] implementations.
pub type CalloutError = Box<dyn std::error::Error + Send + Sync>;

/// An [HttpCallout] that never reaches out and lets every HTTP check fail. This is used when no
/// HTTP transport has been configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHttpCallout;

impl HttpCallout for NoHttpCallout {
    fn invoke(&self, url: &str, _payload: &str) -> Result<bool, CalloutError> {
        Err(format!("no HTTP transport configured for {url}").into())
    }
}

#[derive(Serialize)]
struct HttpPayload<'a> {
    target: &'a Attributes,
    credentials: &'a Attributes,
}

impl Check {
    /// Evaluates this check for the given request. `rule:` checks are resolved against `rules`.
    /// HTTP checks always fail; use [Check::evaluate_with_callout] to enable them.
    pub fn evaluate(&self, req: &Request<'_>, rules: ServiceRules<'_>) -> bool {
        self.evaluate_with_callout(req, rules, &NoHttpCallout)
    }

    /// Like [Check::evaluate], but HTTP checks are delegated to `http`.
    pub fn evaluate_with_callout(
        &self,
        req: &Request<'_>,
        rules: ServiceRules<'_>,
        http: &dyn HttpCallout,
    ) -> bool {
        Evaluation::new(req, rules, http).check(self)
    }
}

/// State of a single evaluation. Tracks the rules that are currently being evaluated, so that
/// reference cycles fail instead of recursing forever.
pub(crate) struct Evaluation<'a> {
    req: &'a Request<'a>,
    rules: ServiceRules<'a>,
    http: &'a dyn HttpCallout,
    in_progress: Vec<String>,
}

impl<'a> Evaluation<'a> {
    pub(crate) fn new(
        req: &'a Request<'a>,
        rules: ServiceRules<'a>,
        http: &'a dyn HttpCallout,
    ) -> Self {
        Evaluation {
            req,
            rules,
            http,
            in_progress: Vec::new(),
        }
    }

    pub(crate) fn check(&mut self, check: &Check) -> bool {
        use Check::*;
        match check {
            Const(val) => *val,
            Role(role) => self.check_role(role),
            Rule(name) => self.check_rule(name),
            Http(url) => self.check_http(url),
            Generic(lhs, rhs) => self.check_generic(lhs, rhs),
            And(operands) => operands.iter().all(|c| self.check(c)),
            Or(operands) => operands.iter().any(|c| self.check(c)),
            Not(x) => !self.check(x),
        }
    }

    /// `role:foo` passes if the credentials cover the role named `foo`.
    fn check_role(&self, role: &Template) -> bool {
        match role.render(self.req.target) {
            Ok(role) => self.req.credentials.has_role(&role),
            Err(unresolved) => {
                tracing::debug!(path = %unresolved.path, "unresolved target attribute in role check");
                false
            }
        }
    }

    /// `rule:foo` returns the result of evaluating the rule `foo`. If no such rule exists (and
    /// the default rule does not apply), the check fails.
    pub(crate) fn check_rule(&mut self, name: &str) -> bool {
        if self.in_progress.iter().any(|n| n == name) {
            tracing::warn!(
                rule = name,
                chain = ?self.in_progress,
                "rule references form a cycle, denying"
            );
            return false;
        }
        let Some(check) = self.rules.get(name) else {
            tracing::debug!(rule = name, "no such rule and no usable default rule, denying");
            return false;
        };

        self.in_progress.push(name.to_owned());
        let result = self.check(check);
        self.in_progress.pop();
        tracing::trace!(rule = name, result, "evaluated rule");
        result
    }

    fn check_http(&self, url: &Template) -> bool {
        let url = match url.render(self.req.target) {
            Ok(url) => url,
            Err(unresolved) => {
                tracing::debug!(path = %unresolved.path, "unresolved target attribute in HTTP check");
                return false;
            }
        };
        let payload = HttpPayload {
            target: self.req.target,
            credentials: self.req.credentials,
        };
        let payload = match serde_json::to_string(&payload) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(%url, "cannot serialize HTTP check payload: {err}");
                return false;
            }
        };
        match self.http.invoke(&url, &payload) {
            Ok(result) => {
                tracing::trace!(%url, result, "evaluated HTTP check");
                result
            }
            Err(err) => {
                tracing::warn!(%url, "HTTP check failed: {err}");
                false
            }
        }
    }

    fn check_generic(&self, lhs: &LeftHandSide, rhs: &Template) -> bool {
        //expand %(foo)s syntax on the right-hand side
        let rhs = match rhs.render(self.req.target) {
            Ok(rhs) => rhs,
            Err(unresolved) => {
                //If an interpolated variable is missing, the entire check fails.
                tracing::debug!(path = %unresolved.path, "unresolved target attribute in generic check");
                return false;
            }
        };

        //option 1: LHS is a literal value
        let key = match lhs {
            LeftHandSide::Literal(val) => return *val == rhs,
            LeftHandSide::Identifier(key) => key,
        };

        //option 2: LHS is the name of a credential attribute; lists match if any element matches
        match self.req.credentials.lookup(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(render_value)
                .any(|item| item == rhs),
            Some(value) => render_value(value).is_some_and(|value| value == rhs),
            //If the requested attribute is missing, the entire check fails.
            None => false,
        }
    }
}
