/// Route resolution for statements
///
/// The resolver owns every loaded rule and the per-table match policy. For a
/// statement it walks the rule's algorithm bindings in order and keeps only
/// the shards every keyed binding agrees on. Bindings without a value are
/// skipped unless the table is MATCH_FIX; with no value at all the table's
/// match policy is applied to the first binding.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::rule::{BoundAlgorithm, RouteRule};
use super::{push_unique, AlgorithmRegistry, MatchPolicy, RouteInfo, RouteKeyData, RouteKeyValue, RouteTargets};
use crate::config::{Config, RouteConfig, TableConfig};
use crate::error::{ConfigError, RouteError, RouteResult};

static NO_VALUE: RouteKeyValue = RouteKeyValue::Null;

/// Resolves route key values to physical shard locations
#[derive(Debug)]
pub struct RouteResolver {
    rules: HashMap<String, RouteRule>,
    tables: HashMap<String, TableConfig>,
}

impl RouteResolver {
    /// Load rules with the built-in algorithms
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::new(
            &config.routes,
            &config.tables,
            &AlgorithmRegistry::with_builtins(),
        )
    }

    pub fn new(
        routes: &[RouteConfig],
        tables: &[TableConfig],
        registry: &AlgorithmRegistry,
    ) -> Result<Self, ConfigError> {
        let rules = RouteRule::load_all(routes, registry)?;
        let mut table_map = HashMap::with_capacity(tables.len());
        for table in tables {
            if !rules.contains_key(&table.route) {
                return Err(ConfigError::ValidationError(format!(
                    "table {} references unknown route {}",
                    table.name, table.route
                )));
            }
            table_map.insert(table.name.clone(), table.clone());
        }
        Ok(Self {
            rules,
            tables: table_map,
        })
    }

    pub fn rule(&self, name: &str) -> RouteResult<&RouteRule> {
        self.rules
            .get(name)
            .ok_or_else(|| RouteError::UnknownRule(name.to_string()))
    }

    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.get(name)
    }

    /// Match policy of a table; unconfigured tables require a key value
    pub fn match_policy(&self, table: &str) -> MatchPolicy {
        self.tables
            .get(table)
            .map(|t| t.match_type)
            .unwrap_or_default()
    }

    /// Resolve a configured table through its own rule
    pub fn resolve_table(&self, table: &str, keys: &RouteKeyData) -> RouteResult<RouteTargets> {
        let config = self
            .tables
            .get(table)
            .ok_or_else(|| RouteError::UnknownRule(format!("(no rule for table {})", table)))?;
        self.resolve(table, &config.route, keys)
    }

    /// Resolve `table` under `rule` for the key values of one statement
    pub fn resolve(&self, table: &str, rule: &str, keys: &RouteKeyData) -> RouteResult<RouteTargets> {
        let rule = self.rule(rule)?;
        let policy = self.match_policy(table);

        let bindings = rule.algorithms();
        if bindings.is_empty() {
            // Unsharded: the rule points at a single location
            let node = rule
                .data_nodes()
                .first()
                .ok_or_else(|| RouteError::NoDataNodes(rule.name().to_string()))?;
            return Ok(RouteTargets::Single(RouteInfo::on_node(table, node)));
        }

        // Every keyed binding narrows the shard set chosen by the ones before it
        let mut candidates: Option<Vec<RouteInfo>> = None;
        for binding in bindings {
            let value = keys.get(&binding.route_key).unwrap_or(&NO_VALUE);
            if value.is_null() {
                if policy == MatchPolicy::Fix {
                    warn!("No value for route key {} of table {}", binding.route_key, table);
                    return Err(RouteError::missing_key(table, binding.route_key.as_str()));
                }
                continue;
            }

            let mut located = Vec::new();
            locate(table, binding, value, &mut located)?;
            let narrowed = match candidates {
                None => located,
                Some(previous) => previous
                    .into_iter()
                    .filter(|route| located.contains(route))
                    .collect(),
            };
            if narrowed.is_empty() {
                warn!("Route keys of table {} select no common shard", table);
                return Err(RouteError::conflicting_keys(table));
            }
            candidates = Some(narrowed);
        }

        let routes = match candidates {
            Some(routes) => routes,
            None => unkeyed(table, policy, &bindings[0])?,
        };

        if let Some(invalid) = routes.iter().find(|r| !r.is_valid()) {
            warn!("Resolved incomplete route {} for table {}", invalid, table);
            return Err(RouteError::NoDataNodes(rule.name().to_string()));
        }

        debug!("Resolved {} to {} route(s) via {}", table, routes.len(), rule.name());
        Ok(RouteTargets::from_routes(routes))
    }

    /// Range lookup through the rule's primary algorithm
    pub fn resolve_range(
        &self,
        table: &str,
        rule: &str,
        start: &str,
        end: &str,
    ) -> RouteResult<Vec<RouteInfo>> {
        let rule = self.rule(rule)?;
        let mut routes = Vec::new();
        match rule.primary() {
            Some(binding) => binding
                .algorithm
                .calculate_range(table, &mut routes, start, end)?,
            None => {
                if let Some(node) = rule.data_nodes().first() {
                    routes.push(RouteInfo::on_node(table, node));
                }
            }
        }
        Ok(routes)
    }
}

/// Every route the binding's algorithm selects for `value`
fn locate(
    table: &str,
    binding: &BoundAlgorithm,
    value: &RouteKeyValue,
    out: &mut Vec<RouteInfo>,
) -> RouteResult<()> {
    let algorithm = &binding.algorithm;
    match value {
        RouteKeyValue::Single(v) => {
            push_unique(out, algorithm.calculate(table, RouteInfo::with_table(table), v)?);
        }
        RouteKeyValue::Multi(values) => {
            for v in values {
                push_unique(out, algorithm.calculate(table, RouteInfo::with_table(table), v)?);
            }
        }
        RouteKeyValue::Range {
            start: Some(start),
            end: Some(end),
        } => {
            algorithm.calculate_range(table, out, start, end)?;
        }
        // Half-open ranges cannot be bounded to a node subset
        RouteKeyValue::Range { .. } | RouteKeyValue::Null => algorithm.all_routes(table, out),
    }
    Ok(())
}

/// Statement without any route key value: the table's match policy decides
fn unkeyed(table: &str, policy: MatchPolicy, primary: &BoundAlgorithm) -> RouteResult<Vec<RouteInfo>> {
    let algorithm = &primary.algorithm;
    let mut routes = Vec::new();
    match policy {
        MatchPolicy::Fix => {
            return Err(RouteError::missing_key(table, primary.route_key.as_str()));
        }
        MatchPolicy::Default => {
            routes.push(algorithm.default_route(table, RouteInfo::with_table(table))?);
        }
        MatchPolicy::All => algorithm.all_routes(table, &mut routes),
    }
    Ok(routes)
}
