use std::collections::HashMap;

use super::{node_at, RouteAlgorithm};
use crate::error::{RouteError, RouteResult};
use crate::routing::{DataNode, RouteInfo};
use crate::utils::crc16;

/// Routes any string key by CRC16 of its bytes modulo node count.
/// Hashing destroys ordering, so range lookups fan out to every node.
#[derive(Debug, Clone)]
pub struct HashAlgorithm {
    nodes: Vec<DataNode>,
}

impl HashAlgorithm {
    pub fn new(nodes: Vec<DataNode>) -> Self {
        Self { nodes }
    }
}

impl RouteAlgorithm for HashAlgorithm {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn configure(&mut self, _params: &HashMap<String, String>) {}

    fn data_nodes(&self) -> &[DataNode] {
        &self.nodes
    }

    fn calculate(&self, _table: &str, mut route: RouteInfo, value: &str) -> RouteResult<RouteInfo> {
        if self.nodes.is_empty() {
            return Err(RouteError::NoDataNodes(self.name().to_string()));
        }
        let index = crc16(value.as_bytes()) as usize % self.nodes.len();
        let node = node_at(&self.nodes, index as i64)?;
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
