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

use dashmap::DashMap;
use std::sync::Arc;

use crate::check::Check;
use crate::parser::{parse_rule, SyntaxError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RuleKey {
    policy_id: String,
    service: String,
    permission: String,
}

#[derive(Debug)]
struct CachedRule {
    condition: String,
    check: Arc<Check>,
}

/// Parsed tenant rules, keyed by policy, service and permission.
///
/// Each entry remembers the condition text that it was parsed from. A cached check is only handed
/// out for the exact same text, so an updated rule replaces its entry on the next lookup.
#[derive(Debug, Default)]
pub struct RuleCache {
    entries: DashMap<RuleKey, CachedRule>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the parsed form of `condition`, parsing it if it is not cached yet.
    pub fn get_or_parse(
        &self,
        policy_id: &str,
        service: &str,
        permission: &str,
        condition: &str,
    ) -> Result<Arc<Check>, SyntaxError> {
        let key = RuleKey {
            policy_id: policy_id.to_owned(),
            service: service.to_owned(),
            permission: permission.to_owned(),
        };
        if let Some(cached) = self.entries.get(&key) {
            if cached.condition == condition {
                return Ok(Arc::clone(&cached.check));
            }
        }

        let check = Arc::new(parse_rule(condition)?);
        self.entries.insert(
            key,
            CachedRule {
                condition: condition.to_owned(),
                check: Arc::clone(&check),
            },
        );
        Ok(check)
    }

    /// Drops all entries belonging to the given policy.
    pub fn invalidate_policy(&self, policy_id: &str) {
        self.entries.retain(|key, _| key.policy_id != policy_id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_and_replacement() {
        let cache = RuleCache::new();
        let first = cache.get_or_parse("p1", "svc", "get", "role:a").unwrap();
        let again = cache.get_or_parse("p1", "svc", "get", "role:a").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(cache.len(), 1);

        //a changed condition replaces the cached interpretation
        let changed = cache.get_or_parse("p1", "svc", "get", "role:b").unwrap();
        assert_eq!(*changed, parse_rule("role:b").unwrap());
        assert_eq!(cache.len(), 1);
        let again = cache.get_or_parse("p1", "svc", "get", "role:b").unwrap();
        assert!(Arc::ptr_eq(&changed, &again));

        //malformed conditions are reported and not cached
        assert!(cache.get_or_parse("p1", "svc", "list", "role:a or").is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidation() {
        let cache = RuleCache::new();
        cache.get_or_parse("p1", "svc", "get", "@").unwrap();
        cache.get_or_parse("p1", "svc", "list", "@").unwrap();
        cache.get_or_parse("p2", "svc", "get", "@").unwrap();
        assert_eq!(cache.len(), 3);

        cache.invalidate_policy("p1");
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
