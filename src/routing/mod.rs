//! Sharding routing engine
//!
//! Maps route key values extracted from a statement to the physical
//! `(backend group, database, table)` locations they live in.
//!
//! ```text
//!  RouteKeyData ──► RouteResolver ──► RouteRule ──► RouteAlgorithm(s)
//!                        │                               │
//!                        └── MatchPolicy (no key) ◄──────┘
//!                                     │
//!                                     ▼
//!                              RouteTargets
//! ```

pub mod algorithm;
pub mod resolver;
pub mod rule;

pub use algorithm::{AlgorithmRegistry, RouteAlgorithm};
pub use resolver::RouteResolver;
pub use rule::{expand_databases, RouteRule};

pub use crate::config::MatchPolicy;

use fnv::FnvHashMap;
use std::fmt;

/// One physical shard location, before a table name is attached
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataNode {
    pub group: String,
    pub database: String,
}

impl DataNode {
    pub fn new<G: Into<String>, D: Into<String>>(group: G, database: D) -> Self {
        Self {
            group: group.into(),
            database: database.into(),
        }
    }
}

impl fmt::Display for DataNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.database)
    }
}

/// Resolved shard target. Equality and hashing cover the whole triple, which
/// is what multi-shard fan-out deduplicates on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RouteInfo {
    pub group: String,
    pub database: String,
    pub table: String,
}

impl RouteInfo {
    pub fn new<G, D, T>(group: G, database: D, table: T) -> Self
    where
        G: Into<String>,
        D: Into<String>,
        T: Into<String>,
    {
        Self {
            group: group.into(),
            database: database.into(),
            table: table.into(),
        }
    }

    /// Route carrying only the table name
    pub fn with_table<T: Into<String>>(table: T) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// Route for `table` placed on `node`
    pub fn on_node<T: Into<String>>(table: T, node: &DataNode) -> Self {
        let mut route = Self::with_table(table);
        route.set_data_node(node);
        route
    }

    pub fn set_data_node(&mut self, node: &DataNode) {
        self.group.clone_from(&node.group);
        self.database.clone_from(&node.database);
    }

    /// A route is usable only when every part is filled in
    pub fn is_valid(&self) -> bool {
        !self.group.is_empty() && !self.database.is_empty() && !self.table.is_empty()
    }
}

impl fmt::Display for RouteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.group, self.database, self.table)
    }
}

/// Push `route` unless an equal route is already present, keeping order
pub(crate) fn push_unique(routes: &mut Vec<RouteInfo>, route: RouteInfo) {
    if !routes.contains(&route) {
        routes.push(route);
    }
}

/// Result of resolving one statement: a single shard or a fan-out set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTargets {
    Single(RouteInfo),
    Multi(Vec<RouteInfo>),
}

impl RouteTargets {
    /// Build from a deduplicated list; a one-element list collapses to `Single`
    pub fn from_routes(mut routes: Vec<RouteInfo>) -> Self {
        if routes.len() == 1 {
            if let Some(route) = routes.pop() {
                return RouteTargets::Single(route);
            }
        }
        RouteTargets::Multi(routes)
    }

    pub fn is_single(&self) -> bool {
        matches!(self, RouteTargets::Single(_))
    }

    pub fn len(&self) -> usize {
        match self {
            RouteTargets::Single(_) => 1,
            RouteTargets::Multi(routes) => routes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RouteInfo> {
        match self {
            RouteTargets::Single(route) => std::slice::from_ref(route).iter(),
            RouteTargets::Multi(routes) => routes.iter(),
        }
    }

    pub fn into_vec(self) -> Vec<RouteInfo> {
        match self {
            RouteTargets::Single(route) => vec![route],
            RouteTargets::Multi(routes) => routes,
        }
    }
}

/// Value of one route key as extracted by the SQL parser
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RouteKeyValue {
    #[default]
    Null,
    Single(String),
    /// Either bound may be missing for a half-open predicate such as `id > 5`
    Range {
        start: Option<String>,
        end: Option<String>,
    },
    Multi(Vec<String>),
}

impl RouteKeyValue {
    pub fn put_value<S: Into<String>>(&mut self, value: S) {
        *self = RouteKeyValue::Single(value.into());
    }

    /// Set the lower bound, keeping an upper bound recorded earlier
    pub fn put_range_start<S: Into<String>>(&mut self, value: S) {
        let end = match std::mem::take(self) {
            RouteKeyValue::Range { end, .. } => end,
            _ => None,
        };
        *self = RouteKeyValue::Range {
            start: Some(value.into()),
            end,
        };
    }

    /// Set the upper bound, keeping a lower bound recorded earlier
    pub fn put_range_end<S: Into<String>>(&mut self, value: S) {
        let start = match std::mem::take(self) {
            RouteKeyValue::Range { start, .. } => start,
            _ => None,
        };
        *self = RouteKeyValue::Range {
            start,
            end: Some(value.into()),
        };
    }

    pub fn put_values(&mut self, values: Vec<String>) {
        *self = RouteKeyValue::Multi(values);
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RouteKeyValue::Null)
    }
}

/// Route key name to value mapping for one statement.
///
/// Nearly every statement carries a single route key, so the map is only
/// allocated once a second distinct key name shows up.
#[derive(Debug, Clone, Default)]
pub struct RouteKeyData {
    key: Option<String>,
    value: RouteKeyValue,
    params: Option<FnvHashMap<String, RouteKeyValue>>,
}

impl RouteKeyData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` and return its value slot for the parser to fill in
    pub fn init_key(&mut self, key: &str) -> &mut RouteKeyValue {
        if self.params.is_none() {
            match self.key.as_deref().map(|first| first == key) {
                None => {
                    self.key = Some(key.to_string());
                    return &mut self.value;
                }
                Some(true) => return &mut self.value,
                Some(false) => {}
            }

            let mut params = FnvHashMap::default();
            if let Some(first) = self.key.take() {
                params.insert(first, std::mem::take(&mut self.value));
            }
            self.params = Some(params);
        }

        match self.params.as_mut() {
            Some(params) => params.entry(key.to_string()).or_default(),
            None => &mut self.value,
        }
    }

    /// Shorthand for `init_key(key).put_value(value)`
    pub fn with_value<S: Into<String>>(mut self, key: &str, value: S) -> Self {
        self.init_key(key).put_value(value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&RouteKeyValue> {
        match (&self.params, &self.key) {
            (Some(params), _) => params.get(key),
            (None, Some(first)) if first == key => Some(&self.value),
            _ => None,
        }
    }

    /// True while at most one key name has been seen
    pub fn is_single(&self) -> bool {
        self.params.is_none()
    }

    pub fn len(&self) -> usize {
        match (&self.params, &self.key) {
            (Some(params), _) => params.len(),
            (None, Some(_)) => 1,
            (None, None) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_route_info_validity_and_identity() {
        let node = DataNode::new("group1", "db1");
        let route = RouteInfo::on_node("orders", &node);
        assert!(route.is_valid());
        assert_eq!(route.to_string(), "group1.db1.orders");

        assert!(!RouteInfo::with_table("orders").is_valid());

        let mut set = HashSet::new();
        set.insert(route.clone());
        set.insert(RouteInfo::new("group1", "db1", "orders"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_route_targets_collapse() {
        let single = RouteTargets::from_routes(vec![RouteInfo::new("g", "d", "t")]);
        assert!(single.is_single());

        let multi = RouteTargets::from_routes(vec![
            RouteInfo::new("g", "d1", "t"),
            RouteInfo::new("g", "d2", "t"),
        ]);
        assert!(!multi.is_single());
        assert_eq!(multi.len(), 2);
        assert_eq!(multi.iter().count(), 2);
    }

    #[test]
    fn test_range_bounds_are_independent() {
        let mut value = RouteKeyValue::Null;
        value.put_range_end("200");
        value.put_range_start("100");
        assert_eq!(
            value,
            RouteKeyValue::Range {
                start: Some("100".to_string()),
                end: Some("200".to_string())
            }
        );

        let mut value = RouteKeyValue::Single("5".to_string());
        value.put_range_start("10");
        assert_eq!(
            value,
            RouteKeyValue::Range {
                start: Some("10".to_string()),
                end: None
            }
        );
    }

    #[test]
    fn test_route_key_data_single_then_many() {
        let mut data = RouteKeyData::new();
        assert!(data.is_empty());

        data.init_key("user_id").put_value("7");
        data.init_key("user_id");
        assert!(data.is_single());
        assert_eq!(
            data.get("user_id"),
            Some(&RouteKeyValue::Single("7".to_string()))
        );
        assert_eq!(data.get("order_id"), None);

        data.init_key("order_id").put_values(vec!["1".into(), "2".into()]);
        assert!(!data.is_single());
        assert_eq!(data.len(), 2);
        assert_eq!(
            data.get("user_id"),
            Some(&RouteKeyValue::Single("7".to_string()))
        );
        assert!(matches!(data.get("order_id"), Some(RouteKeyValue::Multi(v)) if v.len() == 2));
    }
}
