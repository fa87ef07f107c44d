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

use secrecy::SecretString;
use serde::Deserialize;
use std::time::Duration;

/// Settings for an [Enforcer][crate::Enforcer].
///
/// All fields are optional when deserializing; missing fields take the values from
/// [Default::default]. Unknown fields are rejected.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnforcerConfig {
    /// ID of the domain of the cloud service provider. When set, every system service receives a
    /// `csp_domain` rule matching tokens scoped to this domain, unless it defines one itself.
    pub csp_domain_id: Option<String>,
    /// Connection string for the tenant policy storage. Only passed through to the caller that
    /// constructs a [StorageGateway][crate::storage::StorageGateway].
    pub policy_connection: Option<SecretString>,
    /// Name of the rule that is checked when a system rule is missing.
    pub default_rule: String,
    /// Whether errors and denials include details such as targets and credentials.
    pub debug: bool,
    /// Whether parsed tenant rules are cached between calls.
    pub cache_rules: bool,
    /// Upper bound for each storage lookup, in milliseconds.
    pub storage_timeout_ms: Option<u64>,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            csp_domain_id: None,
            policy_connection: None,
            default_rule: "default".to_owned(),
            debug: false,
            cache_rules: true,
            storage_timeout_ms: None,
        }
    }
}

impl EnforcerConfig {
    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    pub fn policy_connection(&self) -> Option<&SecretString> {
        self.policy_connection.as_ref()
    }

    pub fn storage_timeout(&self) -> Option<Duration> {
        self.storage_timeout_ms.map(Duration::from_millis)
    }
}
