/// Backend groups and pool selection
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::{BackendEndpointConfig, BackendGroupConfig, PoolConfig};
use crate::core::connection::Connector;
use crate::pool::{MaintenanceService, PoolService};

/// Chooses the pool a statement for `group` should run on
pub trait BackendGroupSelector: Send + Sync {
    fn select(&self, group: &str, master: bool) -> Option<Arc<PoolService>>;
}

/// Weighted round-robin over a candidate list
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    counter: AtomicUsize,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index into `weights`; zero total weight degrades to plain round-robin
    pub fn select_index(&self, weights: &[usize]) -> Option<usize> {
        if weights.is_empty() {
            return None;
        }
        let tick = self.counter.fetch_add(1, Ordering::Relaxed);
        let total_weight: usize = weights.iter().sum();
        if total_weight == 0 {
            return Some(tick % weights.len());
        }

        let position = tick % total_weight;
        let mut current_weight = 0;
        for (index, weight) in weights.iter().enumerate() {
            current_weight += weight;
            if position < current_weight {
                return Some(index);
            }
        }
        Some(0)
    }
}

/// Master and slave pools sharing one data set
#[derive(Debug)]
pub struct BackendGroup {
    name: String,
    masters: Vec<Arc<PoolService>>,
    slaves: Vec<Arc<PoolService>>,
    master_rr: WeightedRoundRobin,
    slave_rr: WeightedRoundRobin,
}

impl BackendGroup {
    pub fn new(name: String, masters: Vec<Arc<PoolService>>, slaves: Vec<Arc<PoolService>>) -> Self {
        for slave in &slaves {
            slave.set_slave_node(true);
        }
        Self {
            name,
            masters,
            slaves,
            master_rr: WeightedRoundRobin::new(),
            slave_rr: WeightedRoundRobin::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn masters(&self) -> &[Arc<PoolService>] {
        &self.masters
    }

    pub fn slaves(&self) -> &[Arc<PoolService>] {
        &self.slaves
    }

    /// Writes go to a master; reads prefer slaves and fall back to masters
    pub fn select(&self, master: bool) -> Option<Arc<PoolService>> {
        if !master {
            if let Some(pool) = pick_alive(&self.slaves, &self.slave_rr) {
                return Some(pool);
            }
            debug!("Group {} has no live slave, reading from master", self.name);
        }
        pick_alive(&self.masters, &self.master_rr)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<PoolService>> {
        self.masters.iter().chain(self.slaves.iter())
    }
}

fn pick_alive(pools: &[Arc<PoolService>], rr: &WeightedRoundRobin) -> Option<Arc<PoolService>> {
    let alive: Vec<&Arc<PoolService>> = pools.iter().filter(|p| p.is_alive()).collect();
    let weights: Vec<usize> = alive.iter().map(|p| p.weight()).collect();
    rr.select_index(&weights).map(|index| Arc::clone(alive[index]))
}

/// All backend groups of a proxy instance
#[derive(Debug, Default)]
pub struct BackendGroupManager {
    groups: RwLock<HashMap<String, Arc<BackendGroup>>>,
}

impl BackendGroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one pool service per configured endpoint
    pub fn from_config(
        groups: &[BackendGroupConfig],
        pool: &PoolConfig,
        connector: Arc<dyn Connector>,
        maintenance: Arc<MaintenanceService>,
    ) -> Self {
        let manager = Self::new();
        for group in groups {
            let build = |endpoints: &[BackendEndpointConfig]| -> Vec<Arc<PoolService>> {
                endpoints
                    .iter()
                    .map(|endpoint| {
                        PoolService::new(
                            endpoint.clone(),
                            pool,
                            Arc::clone(&connector),
                            Arc::clone(&maintenance),
                        )
                    })
                    .collect()
            };
            let masters = build(&group.masters);
            let slaves = build(&group.slaves);
            manager.add_group(BackendGroup::new(group.name.clone(), masters, slaves));
        }
        manager
    }

    pub fn add_group(&self, group: BackendGroup) {
        let mut groups = self.groups.write();
        groups.insert(group.name.clone(), Arc::new(group));
    }

    pub fn remove_group(&self, name: &str) -> Option<Arc<BackendGroup>> {
        self.groups.write().remove(name)
    }

    pub fn group(&self, name: &str) -> Option<Arc<BackendGroup>> {
        self.groups.read().get(name).cloned()
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every pool in every group
    pub fn pools(&self) -> Vec<Arc<PoolService>> {
        self.groups
            .read()
            .values()
            .flat_map(|group| group.pools().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Number of pools that were started by this call
    pub fn start_all(&self) -> usize {
        let started = self.pools().iter().filter(|pool| pool.start()).count();
        info!("Started {} backend pools", started);
        started
    }

    pub fn stop_all(&self) -> usize {
        let stopped = self.pools().iter().filter(|pool| pool.stop()).count();
        info!("Stopped {} backend pools", stopped);
        stopped
    }
}

impl BackendGroupSelector for BackendGroupManager {
    fn select(&self, group: &str, master: bool) -> Option<Arc<PoolService>> {
        self.group(group)?.select(master)
    }
}
