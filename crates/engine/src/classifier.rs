//! Message classifier — decides whether an alarm falls under a suppression rule.
//!
//! The rule set for a service is cached in the shared store as JSON. A cache
//! miss goes to the [`RuleSource`] through a [`SingleFlight`], so a burst of
//! alarms arriving on a cold cache costs one backing read.
//!
//! Failures anywhere in this path fail open: the alarm is treated as matching
//! no rule, which means it is delivered rather than suppressed.

use std::sync::Arc;
use std::time::Duration;

use herald_common::types::FilterRule;

use crate::rules::RuleSource;
use crate::singleflight::SingleFlight;
use crate::store::AlarmStore;

/// Outcome of classifying one alarm text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// No rule matched; fuse accounting is skipped.
    Unmatched,
    /// A rule matched; repeats are counted against `threshold`.
    Matched { threshold: i64 },
}

impl Classification {
    pub fn should_check_fuse(&self) -> bool {
        matches!(self, Classification::Matched { .. })
    }
}

/// Cache key of a service's rule set.
pub fn rules_cache_key(service_name: &str) -> String {
    format!("{}:alarm:filter_words", service_name)
}

/// Result of reading the rule cache. An unreadable entry is a hit with no rules.
enum CacheLookup {
    Hit(Option<Arc<Vec<FilterRule>>>),
    Miss,
}

pub struct MessageClassifier {
    store: Arc<dyn AlarmStore>,
    source: Arc<dyn RuleSource>,
    cache_ttl: Duration,
    flight: SingleFlight<Option<Arc<Vec<FilterRule>>>>,
}

impl MessageClassifier {
    pub fn new(store: Arc<dyn AlarmStore>, source: Arc<dyn RuleSource>, cache_ttl: Duration) -> Self {
        Self {
            store,
            source,
            cache_ttl,
            flight: SingleFlight::new(),
        }
    }

    /// Find the first rule whose text is contained in `message`.
    pub async fn classify(&self, service_name: &str, message: &str) -> Classification {
        let Some(rules) = self.rules(service_name).await else {
            return Classification::Unmatched;
        };

        rules
            .iter()
            .find(|rule| message.contains(rule.msg.as_str()))
            .map_or(Classification::Unmatched, |rule| Classification::Matched {
                threshold: rule.threshold(),
            })
    }

    /// Current rule set for a service: cache first, then a coalesced fetch.
    pub async fn rules(&self, service_name: &str) -> Option<Arc<Vec<FilterRule>>> {
        let key = rules_cache_key(service_name);

        if let CacheLookup::Hit(rules) = self.read_cache(service_name, &key).await {
            return rules;
        }

        self.flight
            .run(&key, || self.fetch_and_cache(service_name, &key))
            .await
    }

    async fn read_cache(&self, service_name: &str, key: &str) -> CacheLookup {
        match self.store.get(key).await {
            Ok(Some(cached)) => match serde_json::from_str::<Vec<FilterRule>>(&cached) {
                Ok(rules) => CacheLookup::Hit(Some(Arc::new(rules))),
                Err(e) => {
                    tracing::warn!(
                        service = service_name,
                        error = %e,
                        "Cached alarm filter rules are corrupt, ignoring"
                    );
                    CacheLookup::Hit(None)
                }
            },
            Ok(None) => CacheLookup::Miss,
            Err(e) => {
                tracing::warn!(
                    service = service_name,
                    error = %e,
                    "Failed to read alarm filter rule cache"
                );
                CacheLookup::Hit(None)
            }
        }
    }

    async fn fetch_and_cache(&self, service_name: &str, key: &str) -> Option<Arc<Vec<FilterRule>>> {
        // A fetch that finished between our cache miss and this flight already filled it
        if let CacheLookup::Hit(rules) = self.read_cache(service_name, key).await {
            return rules;
        }

        let rules = match self.source.load_rules(service_name).await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!(
                    service = service_name,
                    error = %e,
                    "Failed to load alarm filter rules"
                );
                return None;
            }
        };

        match serde_json::to_string(&rules) {
            Ok(json) => {
                if let Err(e) = self.store.set_ex(key, &json, self.cache_ttl).await {
                    tracing::warn!(
                        service = service_name,
                        error = %e,
                        "Failed to cache alarm filter rules"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(service = service_name, error = %e, "Failed to encode alarm filter rules");
            }
        }

        Some(Arc::new(rules))
    }
}
