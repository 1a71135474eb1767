/// Configuration management for tablero

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub use crate::error::ConfigError;

/// Main tablero configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Session pool tuning shared by every backend endpoint
    #[serde(default)]
    pub pool: PoolConfig,
    /// Backend groups (one primary plus replicas sharing data)
    #[serde(default)]
    pub backend_groups: Vec<BackendGroupConfig>,
    /// Sharding rules
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Logical tables and the rule each one is routed by
    #[serde(default)]
    pub tables: Vec<TableConfig>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the client-facing acceptor listens on
    pub listen_addr: String,
}

/// Pool service tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// How long `get_session` waits for a usable session
    pub acquire_timeout_ms: u64,
    /// Period of the housekeeping sweep
    pub housekeeping_interval_ms: u64,
    /// Upper bound of concurrent session creation workers per pool
    pub creator_workers: usize,
    /// Timeout of a single backend connect attempt
    pub connect_timeout_ms: u64,
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 10_000,
            housekeeping_interval_ms: 30_000,
            creator_workers: 10,
            connect_timeout_ms: 5_000,
        }
    }
}

/// A named set of MySQL endpoints sharing the same data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendGroupConfig {
    pub name: String,
    #[serde(default)]
    pub masters: Vec<BackendEndpointConfig>,
    #[serde(default)]
    pub slaves: Vec<BackendEndpointConfig>,
}

/// One physical MySQL host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEndpointConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "defaults::weight")]
    pub weight: usize,
    #[serde(default = "defaults::max_conn")]
    pub max_conn: usize,
    #[serde(default = "defaults::min_conn")]
    pub min_conn: usize,
    #[serde(default = "defaults::max_retry")]
    pub max_retry: u32,
    #[serde(default = "defaults::conn_idle_timeout_sec")]
    pub conn_idle_timeout_sec: u64,
    #[serde(default = "defaults::conn_busy_timeout_sec")]
    pub conn_busy_timeout_sec: u64,
    #[serde(default = "defaults::conn_max_age_sec")]
    pub conn_max_age_sec: u64,
}

mod defaults {
    pub fn weight() -> usize {
        1
    }
    pub fn max_conn() -> usize {
        1000
    }
    pub fn min_conn() -> usize {
        1
    }
    pub fn max_retry() -> u32 {
        3
    }
    pub fn conn_idle_timeout_sec() -> u64 {
        180
    }
    pub fn conn_busy_timeout_sec() -> u64 {
        180
    }
    pub fn conn_max_age_sec() -> u64 {
        1800
    }
}

impl BackendEndpointConfig {
    /// Endpoint with the documented pool defaults
    pub fn new<H: Into<String>, U: Into<String>>(host: H, port: u16, user: U) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: String::new(),
            weight: defaults::weight(),
            max_conn: defaults::max_conn(),
            min_conn: defaults::min_conn(),
            max_retry: defaults::max_retry(),
            conn_idle_timeout_sec: defaults::conn_idle_timeout_sec(),
            conn_busy_timeout_sec: defaults::conn_busy_timeout_sec(),
            conn_max_age_sec: defaults::conn_max_age_sec(),
        }
    }

    /// `user@host:port`, used to name the pool in logs
    pub fn name(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.conn_idle_timeout_sec)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.conn_busy_timeout_sec)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.conn_max_age_sec)
    }

    fn validate(&self, group: &str) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "backend group {} has an endpoint without host",
                group
            )));
        }
        if self.max_conn == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: max_conn must be greater than 0",
                self.name()
            )));
        }
        if self.min_conn > self.max_conn {
            return Err(ConfigError::ValidationError(format!(
                "{}: min_conn {} exceeds max_conn {}",
                self.name(),
                self.min_conn,
                self.max_conn
            )));
        }
        for (field, value) in [
            ("conn_busy_timeout_sec", self.conn_busy_timeout_sec),
            ("conn_idle_timeout_sec", self.conn_idle_timeout_sec),
            ("conn_max_age_sec", self.conn_max_age_sec),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{}: {} must be greater than 0",
                    self.name(),
                    field
                )));
            }
        }
        Ok(())
    }
}

/// Sharding rule configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    /// Parent rule; only one level of inheritance is allowed
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub data_nodes: Vec<DataNodeConfig>,
    #[serde(default)]
    pub algorithms: Vec<AlgorithmConfig>,
}

/// Physical placement entry of a rule. `databases` accepts the abbreviated
/// form, e.g. `["db1-db20", "db30"]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataNodeConfig {
    pub group: String,
    pub databases: Vec<String>,
}

/// Algorithm bound to one route key
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    pub algorithm: String,
    pub route_key: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Behavior of a table when a statement carries no route key value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchPolicy {
    /// Key value required
    #[default]
    #[serde(rename = "MATCH_FIX")]
    Fix,
    /// Fall back to the default node
    #[serde(rename = "MATCH_DEFAULT")]
    Default,
    /// Fan out to every node
    #[serde(rename = "MATCH_ALL")]
    All,
}

/// Logical table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub route: String,
    #[serde(default)]
    pub match_type: MatchPolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (text, compact)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:3300".to_string(),
            },
            pool: PoolConfig::default(),
            backend_groups: vec![BackendGroupConfig {
                name: "group1".to_string(),
                masters: vec![BackendEndpointConfig::new("127.0.0.1", 3306, "root")],
                slaves: vec![],
            }],
            routes: vec![RouteConfig {
                name: "single".to_string(),
                parent: None,
                data_nodes: vec![DataNodeConfig {
                    group: "group1".to_string(),
                    databases: vec!["db0".to_string()],
                }],
                algorithms: vec![],
            }],
            tables: vec![],
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_addr.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "listen_addr cannot be empty".to_string(),
            ));
        }

        if self.pool.housekeeping_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "housekeeping_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.pool.creator_workers == 0 {
            return Err(ConfigError::ValidationError(
                "creator_workers must be greater than 0".to_string(),
            ));
        }

        let mut groups = HashSet::new();
        for group in &self.backend_groups {
            if !groups.insert(group.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate backend group: {}",
                    group.name
                )));
            }
            if group.masters.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "backend group {} needs at least one master",
                    group.name
                )));
            }
            for endpoint in group.masters.iter().chain(group.slaves.iter()) {
                endpoint.validate(&group.name)?;
            }
        }

        let mut routes = HashSet::new();
        for route in &self.routes {
            if !routes.insert(route.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate route rule: {}",
                    route.name
                )));
            }
            for node in &route.data_nodes {
                if !groups.contains(node.group.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "route {} references unknown backend group {}",
                        route.name, node.group
                    )));
                }
            }
        }

        for table in &self.tables {
            if !routes.contains(table.route.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "table {} references unknown route {}",
                    table.name, table.route
                )));
            }
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "text" | "compact" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file with a range-sharded table
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        Self::example().save_to_file(path)
    }

    /// Two backend groups, eight order shards and a child rule for order items
    pub fn example() -> Self {
        let mut range_params = HashMap::new();
        range_params.insert("start".to_string(), "0".to_string());
        range_params.insert("range".to_string(), "1000000".to_string());

        Config {
            backend_groups: vec![
                BackendGroupConfig {
                    name: "group1".to_string(),
                    masters: vec![BackendEndpointConfig::new("10.0.1.10", 3306, "mydb")],
                    slaves: vec![BackendEndpointConfig::new("10.0.1.11", 3306, "mydb")],
                },
                BackendGroupConfig {
                    name: "group2".to_string(),
                    masters: vec![BackendEndpointConfig::new("10.0.1.20", 3306, "mydb")],
                    slaves: vec![],
                },
            ],
            routes: vec![
                RouteConfig {
                    name: "order_range".to_string(),
                    parent: None,
                    data_nodes: vec![
                        DataNodeConfig {
                            group: "group1".to_string(),
                            databases: vec!["order_db1-order_db4".to_string()],
                        },
                        DataNodeConfig {
                            group: "group2".to_string(),
                            databases: vec!["order_db5-order_db8".to_string()],
                        },
                    ],
                    algorithms: vec![AlgorithmConfig {
                        algorithm: "range".to_string(),
                        route_key: "order_id".to_string(),
                        params: range_params,
                    }],
                },
                RouteConfig {
                    name: "order_item_range".to_string(),
                    parent: Some("order_range".to_string()),
                    data_nodes: vec![],
                    algorithms: vec![],
                },
            ],
            tables: vec![
                TableConfig {
                    name: "orders".to_string(),
                    route: "order_range".to_string(),
                    match_type: MatchPolicy::All,
                },
                TableConfig {
                    name: "order_item".to_string(),
                    route: "order_item_range".to_string(),
                    match_type: MatchPolicy::Fix,
                },
            ],
            ..Default::default()
        }
    }

    /// Find a backend group by name
    pub fn backend_group(&self, name: &str) -> Option<&BackendGroupConfig> {
        self.backend_groups.iter().find(|g| g.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoint_defaults() {
        let toml_str = r#"
host = "127.0.0.1"
port = 3306
user = "root"
"#;
        let endpoint: BackendEndpointConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(endpoint.max_conn, 1000);
        assert_eq!(endpoint.min_conn, 1);
        assert_eq!(endpoint.conn_idle_timeout_sec, 180);
        assert_eq!(endpoint.conn_busy_timeout_sec, 180);
        assert_eq!(endpoint.conn_max_age_sec, 1800);
        assert_eq!(endpoint.weight, 1);
        assert_eq!(endpoint.name(), "root@127.0.0.1:3306");
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.backend_groups[0].masters[0].min_conn = 2000;
        assert!(config.validate().is_err());

        config.backend_groups[0].masters[0].min_conn = 1;
        assert!(config.validate().is_ok());

        config.tables.push(TableConfig {
            name: "t".to_string(),
            route: "missing".to_string(),
            match_type: MatchPolicy::Fix,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_session_timeouts_rejected() {
        let mut config = Config::default();
        config.backend_groups[0].masters[0].conn_busy_timeout_sec = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("conn_busy_timeout_sec must be greater than 0"));

        config.backend_groups[0].masters[0].conn_busy_timeout_sec = 180;
        config.backend_groups[0].masters[0].conn_idle_timeout_sec = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("conn_idle_timeout_sec must be greater than 0"));

        config.backend_groups[0].masters[0].conn_idle_timeout_sec = 180;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_route_with_unknown_group_rejected() {
        let mut config = Config::default();
        config.routes[0].data_nodes[0].group = "nope".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown backend group"));
    }

    #[test]
    fn test_match_policy_serialization() {
        let table: TableConfig =
            toml::from_str("name = \"t\"\nroute = \"r\"\nmatch_type = \"MATCH_ALL\"\n").unwrap();
        assert_eq!(table.match_type, MatchPolicy::All);

        let table: TableConfig = toml::from_str("name = \"t\"\nroute = \"r\"\n").unwrap();
        assert_eq!(table.match_type, MatchPolicy::Fix);
    }

    #[test]
    fn test_config_file_operations() {
        let temp_file = NamedTempFile::new().unwrap();

        Config::create_example_config(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded_config.routes.len(), 2);
        assert_eq!(
            loaded_config.routes[1].parent.as_deref(),
            Some("order_range")
        );
        assert!(loaded_config.backend_group("group2").is_some());
    }
}
