//! Demand read from a TOML file on every tick.
//!
//! ```toml
//! [[demand]]
//! cluster = "hpc-dev"
//! queue = "gpu"
//! compute_resource = "p4d"
//! count = 3
//! ```
//!
//! A missing file means no demand. Entries naming compute resources the
//! cluster does not declare are skipped.

use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use fleet_core::{ResourceKey, Topology};
use fleetgrid_autoscale::{Demand, DemandSignal};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize)]
struct DemandFile {
    #[serde(default)]
    demand: Vec<DemandEntry>,
}

#[derive(Debug, Deserialize)]
struct DemandEntry {
    cluster: String,
    queue: String,
    compute_resource: String,
    count: u32,
}

pub struct FileDemand {
    path: PathBuf,
}

impl FileDemand {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DemandSignal for FileDemand {
    async fn demand(&self, cluster: &str, topology: &Topology) -> anyhow::Result<Demand> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no demand file");
                return Ok(Demand::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read demand file {}", self.path.display()));
            }
        };
        let file: DemandFile = toml::from_str(&content)
            .with_context(|| format!("parse demand file {}", self.path.display()))?;

        Ok(file
            .demand
            .into_iter()
            .filter(|entry| entry.cluster == cluster)
            .filter_map(|entry| {
                let key = ResourceKey::new(&entry.queue, &entry.compute_resource);
                if topology.resolve(&key).is_none() {
                    warn!(%cluster, resource = %key, "demand for undeclared compute resource ignored");
                    return None;
                }
                Some((key, entry.count))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::config::ClusterFile;
    use fleet_core::validate;

    fn topology() -> Topology {
        let file = ClusterFile::from_toml_str(
            r#"
name = "hpc"

[[queues]]
name = "compute"
subnet_ids = ["subnet-1"]

[[queues.compute_resources]]
name = "cpu"
instance_types = ["c5.xlarge"]
"#,
        )
        .unwrap();
        validate(&file.topology).unwrap()
    }

    #[tokio::test]
    async fn reads_entries_for_the_requested_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demand.toml");
        std::fs::write(
            &path,
            r#"
[[demand]]
cluster = "hpc"
queue = "compute"
compute_resource = "cpu"
count = 3

[[demand]]
cluster = "other"
queue = "compute"
compute_resource = "cpu"
count = 7

[[demand]]
cluster = "hpc"
queue = "compute"
compute_resource = "gone"
count = 2
"#,
        )
        .unwrap();

        let demand = FileDemand::new(&path).demand("hpc", &topology()).await.unwrap();
        assert_eq!(demand.get(&ResourceKey::new("compute", "cpu")), Some(3));
        assert_eq!(demand.get(&ResourceKey::new("compute", "gone")), None);
    }

    #[tokio::test]
    async fn missing_file_means_no_demand() {
        let dir = tempfile::tempdir().unwrap();
        let signal = FileDemand::new(dir.path().join("absent.toml"));
        let demand = signal.demand("hpc", &topology()).await.unwrap();
        assert_eq!(demand, Demand::new());
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demand.toml");
        std::fs::write(&path, "[[demand]]\ncluster = 3\n").unwrap();

        let err = FileDemand::new(&path).demand("hpc", &topology()).await.unwrap_err();
        assert!(err.to_string().contains("parse demand file"));
    }
}
