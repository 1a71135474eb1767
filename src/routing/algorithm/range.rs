//! Fixed-width numeric range sharding
//!
//! Parameters: `start` (origin offset, default 0) and `range` (bucket width,
//! default 100). A value `v` lives on node `(v - start) / range`.

use std::collections::HashMap;

use tracing::warn;

use super::{node_at, param_i64, parse_i64, RouteAlgorithm};
use crate::error::{RouteError, RouteResult};
use crate::routing::{push_unique, DataNode, RouteInfo};

const DEFAULT_START: i64 = 0;
const DEFAULT_RANGE: i64 = 100;

/// Routes integer keys into consecutive buckets of `range` values
#[derive(Debug, Clone)]
pub struct RangeAlgorithm {
    nodes: Vec<DataNode>,
    start: i64,
    range: i64,
}

impl RangeAlgorithm {
    pub fn new(nodes: Vec<DataNode>) -> Self {
        Self {
            nodes,
            start: DEFAULT_START,
            range: DEFAULT_RANGE,
        }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn range(&self) -> i64 {
        self.range
    }

    /// Bucket index of `value`, truncated toward zero: values less than one
    /// bucket below `start` still land on node 0, anything lower goes negative.
    fn bucket(&self, value: i64) -> i64 {
        value.saturating_sub(self.start) / self.range
    }
}

impl RouteAlgorithm for RangeAlgorithm {
    fn name(&self) -> &'static str {
        "range"
    }

    fn configure(&mut self, params: &HashMap<String, String>) {
        self.start = param_i64(self.name(), params, "start", DEFAULT_START);
        self.range = param_i64(self.name(), params, "range", DEFAULT_RANGE);
        if self.range <= 0 {
            warn!(
                "range algorithm: range must be positive, got {}, using {}",
                self.range, DEFAULT_RANGE
            );
            self.range = DEFAULT_RANGE;
        }
    }

    fn data_nodes(&self) -> &[DataNode] {
        &self.nodes
    }

    fn calculate(&self, _table: &str, mut route: RouteInfo, value: &str) -> RouteResult<RouteInfo> {
        let value = parse_i64(self.name(), value)?;
        let node = node_at(&self.nodes, self.bucket(value))?;
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
            warn!(
                "range algorithm: range start {} exceeds end {} for {}",
                start_value, end_value, table
            );
            return Err(RouteError::invalid_range(start, end));
        }

        let first = self.bucket(start_value);
        let last = self.bucket(end_value);
        // Check both ends before touching the accumulator
        node_at(&self.nodes, first)?;
        node_at(&self.nodes, last)?;

        for index in first..=last {
            let node = node_at(&self.nodes, index)?;
            push_unique(routes, RouteInfo::on_node(table, node));
        }
        Ok(())
    }
}
