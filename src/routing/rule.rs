/// Sharding rule expansion and inheritance

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use super::algorithm::{AlgorithmRegistry, RouteAlgorithm};
use super::DataNode;
use crate::config::{AlgorithmConfig, DataNodeConfig, RouteConfig};
use crate::error::ConfigError;

/// An algorithm instance bound to the route key it reads
#[derive(Debug)]
pub struct BoundAlgorithm {
    pub route_key: String,
    pub algorithm: Box<dyn RouteAlgorithm>,
}

/// A loaded sharding rule with its expanded node list
pub struct RouteRule {
    name: String,
    parent: Option<String>,
    nodes: Vec<DataNode>,
    algorithms: Vec<BoundAlgorithm>,
}

impl RouteRule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn data_nodes(&self) -> &[DataNode] {
        &self.nodes
    }

    pub fn algorithms(&self) -> &[BoundAlgorithm] {
        &self.algorithms
    }

    /// First bound algorithm; drives key-less range lookups
    pub fn primary(&self) -> Option<&BoundAlgorithm> {
        self.algorithms.first()
    }

    /// Load every rule, resolving parents. A child inherits its parent's node
    /// list and algorithm list wherever it leaves them empty. Parents may not
    /// have parents themselves.
    pub fn load_all(
        configs: &[RouteConfig],
        registry: &AlgorithmRegistry,
    ) -> Result<HashMap<String, RouteRule>, ConfigError> {
        let by_name: HashMap<&str, &RouteConfig> =
            configs.iter().map(|c| (c.name.as_str(), c)).collect();

        let mut rules = HashMap::with_capacity(configs.len());
        for config in configs {
            let (node_configs, algorithm_configs) = match config.parent.as_deref() {
                None => (config.data_nodes.as_slice(), config.algorithms.as_slice()),
                Some(parent_name) => {
                    let parent = by_name.get(parent_name).ok_or_else(|| {
                        ConfigError::Inheritance(format!(
                            "route {} extends unknown route {}",
                            config.name, parent_name
                        ))
                    })?;
                    if let Some(grandparent) = parent.parent.as_deref() {
                        return Err(ConfigError::Inheritance(format!(
                            "route {} extends {} which itself extends {}; only one level is allowed",
                            config.name, parent_name, grandparent
                        )));
                    }
                    (
                        inherit(&config.data_nodes, &parent.data_nodes),
                        inherit(&config.algorithms, &parent.algorithms),
                    )
                }
            };

            let rule = Self::build(config, node_configs, algorithm_configs, registry)?;
            debug!(
                "Loaded route {} with {} nodes and {} algorithms",
                rule.name,
                rule.nodes.len(),
                rule.algorithms.len()
            );
            rules.insert(config.name.clone(), rule);
        }
        Ok(rules)
    }

    fn build(
        config: &RouteConfig,
        node_configs: &[DataNodeConfig],
        algorithm_configs: &[AlgorithmConfig],
        registry: &AlgorithmRegistry,
    ) -> Result<Self, ConfigError> {
        let mut nodes = Vec::new();
        for node_config in node_configs {
            for database in expand_databases(&node_config.databases)? {
                let node = DataNode::new(node_config.group.clone(), database);
                if !nodes.contains(&node) {
                    nodes.push(node);
                }
            }
        }
        if nodes.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "route {} has no data nodes",
                config.name
            )));
        }

        let mut algorithms = Vec::with_capacity(algorithm_configs.len());
        for algorithm_config in algorithm_configs {
            let algorithm = registry
                .create(
                    &algorithm_config.algorithm,
                    nodes.clone(),
                    &algorithm_config.params,
                )
                .map_err(|e| {
                    ConfigError::ValidationError(format!("route {}: {}", config.name, e))
                })?;
            algorithms.push(BoundAlgorithm {
                route_key: algorithm_config.route_key.clone(),
                algorithm,
            });
        }

        Ok(Self {
            name: config.name.clone(),
            parent: config.parent.clone(),
            nodes,
            algorithms,
        })
    }
}

impl fmt::Debug for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteRule")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("nodes", &self.nodes.len())
            .field("algorithms", &self.algorithms)
            .finish()
    }
}

fn inherit<'a, T>(own: &'a [T], parent: &'a [T]) -> &'a [T] {
    if own.is_empty() {
        parent
    } else {
        own
    }
}

/// Expand abbreviated database lists such as `["db1-db3,db7"]` into
/// `db1, db2, db3, db7`. Zero padding of the lower bound is kept
/// (`db01-db03`). Entries without a numeric range are taken literally.
/// Duplicates are dropped, first occurrence wins.
pub fn expand_databases(entries: &[String]) -> Result<Vec<String>, ConfigError> {
    let mut databases: Vec<String> = Vec::new();
    let mut push = |name: String| {
        if !databases.contains(&name) {
            databases.push(name);
        }
    };

    for entry in entries {
        for token in entry.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match parse_range(token)? {
                Some((prefix, first, last, width)) => {
                    for n in first..=last {
                        push(format!("{}{:0width$}", prefix, n, width = width));
                    }
                }
                None => push(token.to_string()),
            }
        }
    }
    Ok(databases)
}

/// `prefix<a>-prefix<b>` or `prefix<a>-<b>`; None when the token is not a range
fn parse_range(token: &str) -> Result<Option<(&str, u64, u64, usize)>, ConfigError> {
    let Some((left, right)) = token.rsplit_once('-') else {
        return Ok(None);
    };
    let (prefix, first_digits) = split_number(left);
    if first_digits.is_empty() {
        return Ok(None);
    }
    let (right_prefix, last_digits) = split_number(right);
    if last_digits.is_empty() || (!right_prefix.is_empty() && right_prefix != prefix) {
        return Ok(None);
    }

    let invalid = || ConfigError::ValidationError(format!("invalid database range: {}", token));
    let first: u64 = first_digits.parse().map_err(|_| invalid())?;
    let last: u64 = last_digits.parse().map_err(|_| invalid())?;
    if first > last {
        return Err(invalid());
    }

    let width = if first_digits.starts_with('0') && first_digits.len() > 1 {
        first_digits.len()
    } else {
        0
    };
    Ok(Some((prefix, first, last, width)))
}

/// Split trailing ASCII digits off `s`
fn split_number(s: &str) -> (&str, &str) {
    let digits = s.bytes().rev().take_while(u8::is_ascii_digit).count();
    s.split_at(s.len() - digits)
}
