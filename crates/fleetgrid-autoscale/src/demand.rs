//! Demand signal — desired dynamic capacity per compute resource.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use fleet_core::{ResourceKey, Topology};
use tokio::sync::RwLock;

/// Requested instance counts for one tick. Resources without an entry have
/// no demand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Demand(BTreeMap<ResourceKey, u32>);

impl Demand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: ResourceKey, count: u32) -> Self {
        self.0.insert(key, count);
        self
    }

    pub fn set(&mut self, key: ResourceKey, count: u32) {
        self.0.insert(key, count);
    }

    pub fn get(&self, key: &ResourceKey) -> Option<u32> {
        self.0.get(key).copied()
    }
}

impl FromIterator<(ResourceKey, u32)> for Demand {
    fn from_iter<I: IntoIterator<Item = (ResourceKey, u32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Source of per-tick demand, e.g. derived from job queue depth.
#[async_trait]
pub trait DemandSignal: Send + Sync {
    async fn demand(&self, cluster: &str, topology: &Topology) -> anyhow::Result<Demand>;
}

/// Demand set programmatically.
#[derive(Default)]
pub struct StaticDemand {
    clusters: RwLock<HashMap<String, Demand>>,
}

impl StaticDemand {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, cluster: &str, key: ResourceKey, count: u32) {
        let mut clusters = self.clusters.write().await;
        clusters.entry(cluster.to_string()).or_default().set(key, count);
    }

    pub async fn replace(&self, cluster: &str, demand: Demand) {
        self.clusters.write().await.insert(cluster.to_string(), demand);
    }
}

#[async_trait]
impl DemandSignal for StaticDemand {
    async fn demand(&self, cluster: &str, _topology: &Topology) -> anyhow::Result<Demand> {
        let clusters = self.clusters.read().await;
        Ok(clusters.get(cluster).cloned().unwrap_or_default())
    }
}
