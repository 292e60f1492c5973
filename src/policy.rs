//! Effective per-route policies and the route table.
//!
//! Overrides are resolved against the global policy exactly once at load
//! time; after startup the table and every [`EffectivePolicy`] in it are
//! immutable and shared behind `Arc`s.

use std::sync::Arc;

use tracing::info;

use crate::config::{Config, ConfigError, GlobalPolicy, RouteOverride};
use crate::route::RoutePattern;

/// Fully resolved comparison policy for one route class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePolicy {
    pub compare_headers: bool,
    pub compare_body: bool,
    pub skip_headers: Vec<String>,
    pub store_req_body: bool,
    pub store_resp_bodies: bool,
    pub skip_json_paths: Vec<String>,
    pub test_probability: u8,
}

impl EffectivePolicy {
    /// Resolve a route override against the global policy.
    ///
    /// Tri-valued booleans inherit or force; list fields are the union of
    /// global entries (first) and override entries, duplicates retained;
    /// `test_probability: 0` inherits, any non-zero value overrides.
    pub fn resolve(global: &GlobalPolicy, route: &RouteOverride) -> Self {
        let mut skip_headers = global.skip_headers.clone();
        skip_headers.extend(route.skip_headers.iter().cloned());

        let mut skip_json_paths = global.skip_json_paths.clone();
        skip_json_paths.extend(route.skip_json_paths.iter().cloned());

        Self {
            compare_headers: route.compare_headers.resolve(global.compare_headers),
            compare_body: route.compare_body.resolve(global.compare_body),
            skip_headers,
            store_req_body: route.store_req_body.resolve(global.store_req_body),
            store_resp_bodies: route.store_resp_bodies.resolve(global.store_resp_bodies),
            skip_json_paths,
            test_probability: if route.test_probability > 0 {
                route.test_probability
            } else {
                global.test_probability
            },
        }
    }
}

impl From<&GlobalPolicy> for EffectivePolicy {
    fn from(global: &GlobalPolicy) -> Self {
        Self {
            compare_headers: global.compare_headers,
            compare_body: global.compare_body,
            skip_headers: global.skip_headers.clone(),
            store_req_body: global.store_req_body,
            store_resp_bodies: global.store_resp_bodies,
            skip_json_paths: global.skip_json_paths.clone(),
            test_probability: global.test_probability,
        }
    }
}

/// Outcome of a route lookup.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The request matched a skip pattern: serve it without any shadow work.
    pub skip: bool,
    pub policy: Arc<EffectivePolicy>,
}

/// Immutable lookup structure built from the configuration.
///
/// Lookup order is a contract: skip patterns are tested first in config
/// order, then route patterns in config order, and the global policy is the
/// universal fallback. Lookup never fails.
#[derive(Debug)]
pub struct RouteTable {
    skip: Vec<RoutePattern>,
    routes: Vec<(RoutePattern, Arc<EffectivePolicy>)>,
    global: Arc<EffectivePolicy>,
}

impl RouteTable {
    /// Compile patterns and resolve policies from a validated config.
    pub fn build(config: &Config) -> Result<Self, ConfigError> {
        let skip = config
            .skip_routes
            .iter()
            .map(|pattern| {
                RoutePattern::compile(pattern).map_err(|reason| ConfigError::InvalidRoutePattern {
                    context: "skip_routes",
                    pattern: pattern.clone(),
                    reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut routes = Vec::with_capacity(config.route_configs.len());
        for (pattern, route_override) in &config.route_configs {
            let compiled = RoutePattern::compile(pattern).map_err(|reason| {
                ConfigError::InvalidRoutePattern {
                    context: "route_configs",
                    pattern: pattern.clone(),
                    reason,
                }
            })?;
            let policy = EffectivePolicy::resolve(&config.global_config, route_override);
            info!(
                pattern = %compiled,
                compare_headers = policy.compare_headers,
                compare_body = policy.compare_body,
                store_req_body = policy.store_req_body,
                store_resp_bodies = policy.store_resp_bodies,
                test_probability = policy.test_probability,
                "resolved route policy"
            );
            routes.push((compiled, Arc::new(policy)));
        }

        let global = EffectivePolicy::from(&config.global_config);
        info!(
            compare_headers = global.compare_headers,
            compare_body = global.compare_body,
            store_req_body = global.store_req_body,
            store_resp_bodies = global.store_resp_bodies,
            test_probability = global.test_probability,
            "resolved global policy"
        );

        Ok(Self {
            skip,
            routes,
            global: Arc::new(global),
        })
    }

    /// Look up the policy for a request. First matching skip pattern wins;
    /// otherwise the first matching route pattern's policy applies; the
    /// global policy is the fallback.
    pub fn resolve(&self, method: &str, path: &str) -> Resolution {
        if self.skip.iter().any(|p| p.matches(method, path)) {
            return Resolution {
                skip: true,
                policy: Arc::clone(&self.global),
            };
        }

        for (pattern, policy) in &self.routes {
            if pattern.matches(method, path) {
                return Resolution {
                    skip: false,
                    policy: Arc::clone(policy),
                };
            }
        }

        Resolution {
            skip: false,
            policy: Arc::clone(&self.global),
        }
    }

    /// The global fallback policy.
    pub fn global(&self) -> &Arc<EffectivePolicy> {
        &self.global
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Toggle;

    fn global() -> GlobalPolicy {
        GlobalPolicy {
            skip_headers: vec!["Date".to_string()],
            skip_json_paths: vec!["meta.ts".to_string()],
            test_probability: 80,
            ..GlobalPolicy::default()
        }
    }

    #[test]
    fn unset_override_inherits_everything() {
        let g = global();
        let resolved = EffectivePolicy::resolve(&g, &RouteOverride::default());
        assert_eq!(resolved, EffectivePolicy::from(&g));
    }

    #[test]
    fn toggles_force_values() {
        let g = global();
        let ov = RouteOverride {
            compare_headers: Toggle::Disable,
            store_req_body: Toggle::Enable,
            ..RouteOverride::default()
        };
        let resolved = EffectivePolicy::resolve(&g, &ov);
        assert!(!resolved.compare_headers);
        assert!(resolved.store_req_body);
        // Untouched fields still inherit.
        assert!(resolved.compare_body);
        assert!(resolved.store_resp_bodies);
    }

    #[test]
    fn lists_are_additive_global_first() {
        let g = global();
        let ov = RouteOverride {
            skip_headers: vec!["X-Trace".to_string()],
            skip_json_paths: vec!["request_id".to_string()],
            ..RouteOverride::default()
        };
        let resolved = EffectivePolicy::resolve(&g, &ov);
        assert_eq!(resolved.skip_headers, vec!["Date", "X-Trace"]);
        assert_eq!(resolved.skip_json_paths, vec!["meta.ts", "request_id"]);
    }

    #[test]
    fn zero_probability_inherits() {
        let g = global();
        let resolved = EffectivePolicy::resolve(&g, &RouteOverride::default());
        assert_eq!(resolved.test_probability, 80);

        let ov = RouteOverride {
            test_probability: 5,
            ..RouteOverride::default()
        };
        assert_eq!(EffectivePolicy::resolve(&g, &ov).test_probability, 5);
    }

    fn table(yaml: &str) -> RouteTable {
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        RouteTable::build(&config).unwrap()
    }

    #[test]
    fn resolve_falls_back_to_global() {
        let t = table("global_config:\n  test_probability: 42\n");
        let r = t.resolve("GET", "/anything/at/all");
        assert!(!r.skip);
        assert_eq!(r.policy.test_probability, 42);
    }

    #[test]
    fn skip_patterns_win_over_route_configs() {
        let t = table(
            r#"
route_configs:
  "GET:/healthz":
    test_probability: 50
skip_routes:
  - "GET:/healthz"
"#,
        );
        assert!(t.resolve("GET", "/healthz").skip);
        assert!(!t.resolve("POST", "/healthz").skip);
    }

    #[test]
    fn config_order_decides_between_overlapping_patterns() {
        let t = table(
            r#"
route_configs:
  "GET:/u/me/p":
    test_probability: 100
  "GET:/u/*/p":
    test_probability: 50
  "GET:/u/*":
    test_probability: 10
"#,
        );
        assert_eq!(t.resolve("GET", "/u/me/p").policy.test_probability, 100);
        assert_eq!(t.resolve("GET", "/u/42/p").policy.test_probability, 50);
        assert_eq!(t.resolve("GET", "/u/42/x").policy.test_probability, 10);
    }

    #[test]
    fn earlier_general_pattern_shadows_later_specific_one() {
        let t = table(
            r#"
route_configs:
  "GET:/u/*":
    test_probability: 10
  "GET:/u/me":
    test_probability: 100
"#,
        );
        // Config order is the contract, even when a later pattern is an
        // exact literal for the request.
        assert_eq!(t.resolve("GET", "/u/me").policy.test_probability, 10);
    }
}
