use std::collections::HashMap;

use tracing::warn;

use super::{node_at, RouteAlgorithm};
use crate::error::{RouteError, RouteResult};
use crate::routing::{DataNode, RouteInfo};

/// Explicit value to node index table, e.g. `cn = "0"`, `us = "1"`.
/// The `default` parameter names the index for unlisted values.
#[derive(Debug, Clone)]
pub struct FixedAlgorithm {
    nodes: Vec<DataNode>,
    mapping: HashMap<String, i64>,
    default_index: Option<i64>,
}

impl FixedAlgorithm {
    pub fn new(nodes: Vec<DataNode>) -> Self {
        Self {
            nodes,
            mapping: HashMap::new(),
            default_index: None,
        }
    }
}

impl RouteAlgorithm for FixedAlgorithm {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn configure(&mut self, params: &HashMap<String, String>) {
        self.mapping.clear();
        self.default_index = None;
        for (key, raw) in params {
            let index = match raw.trim().parse::<i64>() {
                Ok(index) => index,
                Err(_) => {
                    warn!("fixed algorithm: ignoring {}='{}', not a node index", key, raw);
                    continue;
                }
            };
            if key == "default" {
                self.default_index = Some(index);
            } else {
                self.mapping.insert(key.clone(), index);
            }
        }
    }

    fn data_nodes(&self) -> &[DataNode] {
        &self.nodes
    }

    fn calculate(&self, _table: &str, mut route: RouteInfo, value: &str) -> RouteResult<RouteInfo> {
        let index = self
            .mapping
            .get(value)
            .copied()
            .or(self.default_index)
            .ok_or_else(|| RouteError::invalid_value(self.name(), value))?;
        let node = node_at(&self.nodes, index)?;
        route.set_data_node(node);
        Ok(route)
    }

    fn calculate_range(
        &self,
        table: &str,
        routes: &mut Vec<RouteInfo>,
        _start: &str,
        _end: &str,
    ) -> RouteResult<()> {
        self.all_routes(table, routes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::algorithm::test_nodes;

    fn configured() -> FixedAlgorithm {
        let mut algorithm = FixedAlgorithm::new(test_nodes(3));
        let mut params = HashMap::new();
        params.insert("cn".to_string(), "0".to_string());
        params.insert("us".to_string(), "2".to_string());
        params.insert("eu".to_string(), "seven".to_string());
        params.insert("mars".to_string(), "9".to_string());
        algorithm.configure(&params);
        algorithm
    }

    #[test]
    fn test_mapped_values() {
        let algorithm = configured();
        let route = algorithm
            .calculate("t", RouteInfo::with_table("t"), "us")
            .unwrap();
        assert_eq!(route.database, "db2");
    }

    #[test]
    fn test_unmapped_value_without_default() {
        let algorithm = configured();
        let err = algorithm
            .calculate("t", RouteInfo::with_table("t"), "eu")
            .unwrap_err();
        assert!(matches!(err, RouteError::InvalidValue { .. }));

        let err = algorithm
            .calculate("t", RouteInfo::with_table("t"), "mars")
            .unwrap_err();
        assert!(matches!(err, RouteError::NodeIndexOutOfBounds { index: 9, .. }));
    }

    #[test]
    fn test_default_index() {
        let mut algorithm = configured();
        let mut params = HashMap::new();
        params.insert("default".to_string(), "1".to_string());
        algorithm.configure(&params);
        let route = algorithm
            .calculate("t", RouteInfo::with_table("t"), "anything")
            .unwrap();
        assert_eq!(route.database, "db1");
    }
}
