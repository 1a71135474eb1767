//! Routing algorithms
//!
//! Each sharding rule binds one or more algorithm instances to route key
//! names. An algorithm owns the rule's expanded data node list and maps key
//! values onto it:
//!
//! - `RangeAlgorithm` (`range`): fixed-width numeric buckets
//! - `ModAlgorithm` (`mod`): numeric value modulo node count
//! - `HashAlgorithm` (`hash`): CRC16 of the raw value modulo node count
//! - `FixedAlgorithm` (`fixed`): explicit value to node index table
//!
//! New algorithms are added through `AlgorithmRegistry::register`.

mod fixed;
mod hash;
mod modulo;
mod range;

pub use fixed::FixedAlgorithm;
pub use hash::HashAlgorithm;
pub use modulo::ModAlgorithm;
pub use range::RangeAlgorithm;

use std::collections::HashMap;
use std::fmt;

use fnv::FnvHashMap;
use tracing::warn;

use super::{push_unique, DataNode, RouteInfo};
use crate::error::{RouteError, RouteResult};

/// Sharding strategy bound to one route key of a rule
pub trait RouteAlgorithm: Send + Sync + fmt::Debug {
    /// Identifier the algorithm is registered under
    fn name(&self) -> &'static str;

    /// Parse string parameters into typed fields. Malformed values are logged
    /// and replaced by the algorithm's defaults.
    fn configure(&mut self, params: &HashMap<String, String>);

    /// Expanded physical nodes this instance routes into
    fn data_nodes(&self) -> &[DataNode];

    /// Point lookup: place `route` on the node owning `value`
    fn calculate(&self, table: &str, route: RouteInfo, value: &str) -> RouteResult<RouteInfo>;

    /// Range lookup: append every node touched by `[start, end]` to `routes`,
    /// skipping routes already present
    fn calculate_range(
        &self,
        table: &str,
        routes: &mut Vec<RouteInfo>,
        start: &str,
        end: &str,
    ) -> RouteResult<()>;

    /// Batch point lookup, one route per distinct value
    fn calculate_values(
        &self,
        table: &str,
        routes: &mut FnvHashMap<String, RouteInfo>,
        values: &[String],
    ) -> RouteResult<()> {
        for value in values {
            if routes.contains_key(value) {
                continue;
            }
            let route = self.calculate(table, RouteInfo::with_table(table), value)?;
            routes.insert(value.clone(), route);
        }
        Ok(())
    }

    /// Full fan-out: one route per configured node
    fn all_routes(&self, table: &str, routes: &mut Vec<RouteInfo>) {
        for node in self.data_nodes() {
            push_unique(routes, RouteInfo::on_node(table, node));
        }
    }

    /// Route used when no key value is present and the table allows
    /// defaulting. The first configured node is the default shard.
    fn default_route(&self, _table: &str, mut route: RouteInfo) -> RouteResult<RouteInfo> {
        let node = self
            .data_nodes()
            .first()
            .ok_or_else(|| RouteError::NoDataNodes(self.name().to_string()))?;
        route.set_data_node(node);
        Ok(route)
    }
}

/// Constructor stored in the registry
pub type AlgorithmFactory = fn(Vec<DataNode>) -> Box<dyn RouteAlgorithm>;

/// Maps algorithm identifiers to constructors
#[derive(Clone)]
pub struct AlgorithmRegistry {
    factories: HashMap<String, AlgorithmFactory>,
}

impl AlgorithmRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in algorithms
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("range", |nodes| Box::new(RangeAlgorithm::new(nodes)));
        registry.register("mod", |nodes| Box::new(ModAlgorithm::new(nodes)));
        registry.register("hash", |nodes| Box::new(HashAlgorithm::new(nodes)));
        registry.register("fixed", |nodes| Box::new(FixedAlgorithm::new(nodes)));
        registry
    }

    /// Register or replace an algorithm constructor
    pub fn register<S: Into<String>>(&mut self, name: S, factory: AlgorithmFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build and configure an algorithm instance over `nodes`
    pub fn create(
        &self,
        name: &str,
        nodes: Vec<DataNode>,
        params: &HashMap<String, String>,
    ) -> RouteResult<Box<dyn RouteAlgorithm>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RouteError::UnknownAlgorithm(name.to_string()))?;
        let mut algorithm = factory(nodes);
        algorithm.configure(params);
        Ok(algorithm)
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("AlgorithmRegistry")
            .field("algorithms", &names)
            .finish()
    }
}

/// Read an integer parameter, falling back to `default` when absent or malformed
pub(crate) fn param_i64(
    algorithm: &str,
    params: &HashMap<String, String>,
    key: &str,
    default: i64,
) -> i64 {
    match params.get(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<i64>() {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "{} algorithm: parameter {}='{}' is invalid ({}), using {}",
                    algorithm, key, raw, e, default
                );
                default
            }
        },
    }
}

/// Parse a route key value as a signed 64-bit integer
pub(crate) fn parse_i64(algorithm: &str, value: &str) -> RouteResult<i64> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| RouteError::invalid_value(algorithm, value))
}

/// Node at `index`, or an out-of-bounds error
pub(crate) fn node_at(nodes: &[DataNode], index: i64) -> RouteResult<&DataNode> {
    usize::try_from(index)
        .ok()
        .and_then(|i| nodes.get(i))
        .ok_or_else(|| {
            warn!("node index {} out of bounds, node count {}", index, nodes.len());
            RouteError::out_of_bounds(index, nodes.len())
        })
}

#[cfg(test)]
pub(crate) fn test_nodes(count: usize) -> Vec<DataNode> {
    (0..count)
        .map(|i| DataNode::new("group1", format!("db{}", i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_builtins() {
        let registry = AlgorithmRegistry::with_builtins();
        for name in ["range", "mod", "hash", "fixed"] {
            assert!(registry.contains(name), "missing {}", name);
        }

        let algorithm = registry
            .create("range", test_nodes(2), &HashMap::new())
            .unwrap();
        assert_eq!(algorithm.name(), "range");
        assert_eq!(algorithm.data_nodes().len(), 2);
    }

    #[test]
    fn test_registry_unknown_algorithm() {
        let registry = AlgorithmRegistry::with_builtins();
        let err = registry
            .create("consistent", test_nodes(2), &HashMap::new())
            .unwrap_err();
        assert_eq!(err, RouteError::UnknownAlgorithm("consistent".to_string()));
    }

    #[test]
    fn test_default_and_all_routes() {
        let algorithm = RangeAlgorithm::new(test_nodes(3));

        let route = algorithm
            .default_route("orders", RouteInfo::with_table("orders"))
            .unwrap();
        assert_eq!(route, RouteInfo::new("group1", "db0", "orders"));

        let mut routes = vec![RouteInfo::new("group1", "db1", "orders")];
        algorithm.all_routes("orders", &mut routes);
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0].database, "db1");
    }

    #[test]
    fn test_calculate_values_dedups_by_value() {
        let algorithm = RangeAlgorithm::new(test_nodes(3));
        let mut routes = FnvHashMap::default();
        let values = vec!["5".to_string(), "150".to_string(), "5".to_string()];

        algorithm
            .calculate_values("orders", &mut routes, &values)
            .unwrap();

        assert_eq!(routes.len(), 2);
        assert_eq!(routes["5"].database, "db0");
        assert_eq!(routes["150"].database, "db1");
    }

    #[test]
    fn test_param_fallback() {
        let mut params = HashMap::new();
        params.insert("range".to_string(), "abc".to_string());
        assert_eq!(param_i64("range", &params, "range", 100), 100);
        assert_eq!(param_i64("range", &params, "start", 0), 0);

        params.insert("range".to_string(), " 250 ".to_string());
        assert_eq!(param_i64("range", &params, "range", 100), 250);
    }
}
