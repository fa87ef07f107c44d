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

use std::borrow::Cow;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The credential attribute holding the list of role names.
pub const ROLES_ATTRIBUTE: &str = "roles";

static NO_ATTRIBUTES: LazyLock<Attributes> = LazyLock::new(Attributes::default);

/// Attributes belonging to a single request.
#[derive(Clone, Copy, Debug)]
pub struct Request<'a> {
    /// Attributes describing the caller: user ID, domain or project scope, roles.
    pub credentials: &'a Attributes,
    /// Attributes describing the object(s) being acted upon.
    pub target: &'a Attributes,
}

impl<'a> Request<'a> {
    /// Create a new request without target attributes.
    ///
    /// Credential attributes can appear on the left side of a generic check. For example,
    /// `project_name:cloud_admin` checks whether the credential attribute `project_name` has the
    /// string value `cloud_admin`. Roles are read from the `roles` attribute, which should be a
    /// list of strings.
    pub fn new(credentials: &'a Attributes) -> Self {
        Request {
            credentials,
            target: &NO_ATTRIBUTES,
        }
    }

    /// Add target attributes to this request. This is usually chained directly after
    /// [Request::new].
    #[must_use]
    pub fn with_target(mut self, target: &'a Attributes) -> Self {
        self.target = target;
        self
    }
}

/// A tree of attributes, used for both credentials and targets.
///
/// Attributes are addressed with dotted paths. A path like `obj.user.id` matches a top-level key
/// `obj.user.id` as well as nested maps `{"obj": {"user": {"id": ...}}}` and any mix of the two,
/// so flattened and structured attribute sets can be used interchangeably.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(Map<String, Value>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` if `value` is not a JSON object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Attributes(map)),
            _ => None,
        }
    }

    /// Builder-style variant of [Attributes::insert].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Finds the attribute at the given dotted path.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        find_in_map(&self.0, path)
    }

    /// Like [Attributes::lookup], but renders the value as a string. Only strings, numbers and
    /// booleans have a string form.
    pub fn lookup_str(&self, path: &str) -> Option<Cow<'_, str>> {
        self.lookup(path).and_then(render_value)
    }

    /// Returns whether the `roles` attribute contains the given role. Role names are compared
    /// case-insensitively.
    pub fn has_role(&self, role_name: &str) -> bool {
        match self.0.get(ROLES_ATTRIBUTE) {
            Some(Value::Array(roles)) => roles
                .iter()
                .filter_map(Value::as_str)
                .any(|r| r.eq_ignore_ascii_case(role_name)),
            _ => false,
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Attributes {
    fn from(map: Map<String, Value>) -> Self {
        Attributes(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Attributes(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn find_in_map<'v>(map: &'v Map<String, Value>, path: &str) -> Option<&'v Value> {
    if let Some(value) = map.get(path) {
        return Some(value);
    }
    //try every split point, so that keys containing dots are found as well
    path.match_indices('.').find_map(|(idx, _)| {
        match map.get(&path[..idx]) {
            Some(Value::Object(inner)) => find_in_map(inner, &path[idx + 1..]),
            _ => None,
        }
    })
}

/// Renders a scalar attribute value in the form that the policy language compares against.
/// Booleans are rendered as `True` and `False` to match the literals that rules are written with.
pub(crate) fn render_value(value: &Value) -> Option<Cow<'_, str>> {
    match value {
        Value::String(s) => Some(Cow::Borrowed(s)),
        Value::Bool(true) => Some(Cow::Borrowed("True")),
        Value::Bool(false) => Some(Cow::Borrowed("False")),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dotted_lookup() {
        let attrs = Attributes::from_value(json!({
            "scope.domain_id": "d-1",
            "obj": {
                "user": {"id": "u-1"},
                "project.id": "p-1",
            },
            "roles": ["Admin", "member", 3],
        }))
        .unwrap();

        assert_eq!(attrs.lookup_str("scope.domain_id").as_deref(), Some("d-1"));
        assert_eq!(attrs.lookup_str("obj.user.id").as_deref(), Some("u-1"));
        assert_eq!(attrs.lookup_str("obj.project.id").as_deref(), Some("p-1"));
        assert_eq!(attrs.lookup("obj.user"), Some(&json!({"id": "u-1"})));
        assert_eq!(attrs.lookup_str("obj.user"), None);
        assert_eq!(attrs.lookup("obj.user.name"), None);
        assert_eq!(attrs.lookup("scope"), None);
        assert_eq!(attrs.lookup(""), None);

        assert!(attrs.has_role("admin"));
        assert!(attrs.has_role("MEMBER"));
        assert!(!attrs.has_role("3"));
        assert!(!Attributes::new().has_role("admin"));
    }

    #[test]
    fn test_request_defaults_to_empty_target() {
        let credentials: Attributes = [("user_id", "u-1")].into_iter().collect();
        let req = Request::new(&credentials);
        assert_eq!(req.target, &Attributes::new());

        let target = Attributes::new().with("id", 5);
        let req = req.with_target(&target);
        assert_eq!(req.target.lookup_str("id").as_deref(), Some("5"));
        assert_eq!(req.credentials.lookup_str("user_id").as_deref(), Some("u-1"));
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert_eq!(Attributes::from_value(json!(["a"])), None);
        assert_eq!(Attributes::from_value(json!("a")), None);
    }
}
