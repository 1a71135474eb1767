use std::collections::HashMap;

use super::{node_at, param_i64, parse_i64, RouteAlgorithm};
use crate::error::{RouteError, RouteResult};
use crate::routing::{push_unique, DataNode, RouteInfo};

/// Routes integer keys to `(value - start) mod node_count`
#[derive(Debug, Clone)]
pub struct ModAlgorithm {
    nodes: Vec<DataNode>,
    start: i64,
}

impl ModAlgorithm {
    pub fn new(nodes: Vec<DataNode>) -> Self {
        Self { nodes, start: 0 }
    }

    fn index(&self, value: i64) -> RouteResult<i64> {
        if self.nodes.is_empty() {
            return Err(RouteError::NoDataNodes(self.name().to_string()));
        }
        Ok(value
            .saturating_sub(self.start)
            .rem_euclid(self.nodes.len() as i64))
    }
}

impl RouteAlgorithm for ModAlgorithm {
    fn name(&self) -> &'static str {
        "mod"
    }

    fn configure(&mut self, params: &HashMap<String, String>) {
        self.start = param_i64(self.name(), params, "start", 0);
    }

    fn data_nodes(&self) -> &[DataNode] {
        &self.nodes
    }

    fn calculate(&self, _table: &str, mut route: RouteInfo, value: &str) -> RouteResult<RouteInfo> {
        let value = parse_i64(self.name(), value)?;
        let node = node_at(&self.nodes, self.index(value)?)?;
        route.set_data_node(node);
        Ok(route)
    }

    fn calculate_range(
        &self,
        table: &str,
        routes: &mut Vec<RouteInfo>,
        start: &str,
        end: &str,
    ) -> RouteResult<()> {
        let start_value = parse_i64(self.name(), start)?;
        let end_value = parse_i64(self.name(), end)?;
        if start_value > end_value {
            return Err(RouteError::invalid_range(start, end));
        }

        // A span of node_count consecutive values touches every node
        let span = (end_value as i128) - (start_value as i128) + 1;
        if span >= self.nodes.len() as i128 {
            self.all_routes(table, routes);
            return Ok(());
        }

        for value in start_value..=end_value {
            let node = node_at(&self.nodes, self.index(value)?)?;
            push_unique(routes, RouteInfo::on_node(table, node));
        }
        Ok(())
    }
}
