//! Topology Index
//!
//! Maps each subscriber device to its ordered upstream path (nearest ancestor
//! first, CMTS port last). Readers take an `Arc` snapshot; a refresh swaps the
//! whole snapshot atomically so in-flight correlations keep the paths they
//! started with.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::{PnmError, PnmResult};
use crate::models::{DeviceClass, DeviceNode};

/// Serialized form delivered by the inventory system
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyDocument {
    /// Shared plant elements (amplifiers, fiber nodes, CMTS ports, ...)
    #[serde(default)]
    pub nodes: Vec<InfrastructureNode>,
    #[serde(default)]
    pub devices: Vec<DeviceNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureNode {
    pub node_id: String,
    pub node_class: DeviceClass,
}

/// Immutable view of the plant
#[derive(Debug, Default)]
pub struct TopologySnapshot {
    devices: HashMap<String, DeviceNode>,
    node_classes: HashMap<String, DeviceClass>,
    version: u64,
    loaded_at: Option<DateTime<Utc>>,
}

impl TopologySnapshot {
    /// Build and validate a snapshot. Paths must not repeat a node or contain
    /// the device itself.
    pub fn from_document(doc: TopologyDocument) -> anyhow::Result<Self> {
        let mut node_classes = HashMap::with_capacity(doc.nodes.len());
        for node in doc.nodes {
            if node_classes.insert(node.node_id.clone(), node.node_class).is_some() {
                bail!("duplicate infrastructure node {}", node.node_id);
            }
        }

        let mut devices = HashMap::with_capacity(doc.devices.len());
        for device in doc.devices {
            let mut seen = HashSet::with_capacity(device.upstream_path.len());
            for hop in &device.upstream_path {
                if hop == &device.device_id {
                    bail!("device {} lists itself in its upstream path", device.device_id);
                }
                if !seen.insert(hop.as_str()) {
                    bail!("device {} repeats {} in its upstream path", device.device_id, hop);
                }
            }
            if devices.contains_key(&device.device_id) {
                bail!("duplicate device {}", device.device_id);
            }
            devices.insert(device.device_id.clone(), device);
        }

        Ok(Self {
            devices,
            node_classes,
            version: 0,
            loaded_at: Some(Utc::now()),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn contains_device(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn device(&self, device_id: &str) -> PnmResult<&DeviceNode> {
        self.devices
            .get(device_id)
            .ok_or_else(|| PnmError::UnknownDevice(device_id.to_string()))
    }

    /// Ordered ancestors of a device, nearest first
    pub fn resolve_path(&self, device_id: &str) -> PnmResult<&[String]> {
        self.device(device_id).map(|d| d.upstream_path.as_slice())
    }

    /// Nearest node shared by both devices' paths, if any
    pub fn common_ancestor(&self, a: &str, b: &str) -> PnmResult<Option<&str>> {
        let path_a = self.resolve_path(a)?;
        let path_b = self.resolve_path(b)?;
        let in_b: HashSet<&str> = path_b.iter().map(String::as_str).collect();
        Ok(path_a.iter().map(String::as_str).find(|hop| in_b.contains(hop)))
    }

    /// Class of any element: subscriber device or infrastructure node
    pub fn node_class(&self, node_id: &str) -> DeviceClass {
        if let Some(class) = self.node_classes.get(node_id) {
            return *class;
        }
        self.devices
            .get(node_id)
            .map(|d| d.device_class)
            .unwrap_or(DeviceClass::Unknown)
    }
}

/// Shared, atomically replaceable topology
pub struct TopologyIndex {
    current: ArcSwap<TopologySnapshot>,
    next_version: AtomicU64,
}

impl TopologyIndex {
    pub fn new(snapshot: TopologySnapshot) -> Self {
        let index = Self {
            current: ArcSwap::from_pointee(TopologySnapshot::default()),
            next_version: AtomicU64::new(1),
        };
        index.replace(snapshot);
        index
    }

    pub fn from_document(doc: TopologyDocument) -> anyhow::Result<Self> {
        Ok(Self::new(TopologySnapshot::from_document(doc)?))
    }

    pub fn empty() -> Self {
        Self::new(TopologySnapshot::default())
    }

    /// Current snapshot; stays valid even if a refresh lands meanwhile
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.current.load_full()
    }

    /// Swap in a new snapshot, returning its version
    pub fn replace(&self, mut snapshot: TopologySnapshot) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        snapshot.version = version;
        snapshot.loaded_at = Some(Utc::now());
        let paths_changed = log_path_changes(&self.current.load(), &snapshot);
        info!(
            version,
            devices = snapshot.devices.len(),
            nodes = snapshot.node_classes.len(),
            paths_changed,
            "Topology snapshot installed"
        );
        self.current.store(Arc::new(snapshot));
        version
    }

    pub fn resolve_path(&self, device_id: &str) -> PnmResult<Vec<String>> {
        self.snapshot().resolve_path(device_id).map(|p| p.to_vec())
    }

    pub fn common_ancestor(&self, a: &str, b: &str) -> PnmResult<Option<String>> {
        self.snapshot()
            .common_ancestor(a, b)
            .map(|n| n.map(str::to_string))
    }

    pub fn contains_device(&self, device_id: &str) -> bool {
        self.current.load().contains_device(device_id)
    }
}

/// External inventory the index is refreshed from
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<TopologyDocument>;
}

/// Reads a JSON or TOML topology document from disk (chosen by extension)
pub struct FileTopologySource {
    path: PathBuf,
}

impl FileTopologySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TopologySource for FileTopologySource {
    async fn fetch(&self) -> anyhow::Result<TopologyDocument> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading topology {}", self.path.display()))?;

        let is_toml = self
            .path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let doc = if is_toml {
            toml::from_str(&content)
                .with_context(|| format!("parsing topology {}", self.path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("parsing topology {}", self.path.display()))?
        };
        Ok(doc)
    }
}

/// Fetch once and install; errors leave the current snapshot in place
pub async fn refresh_once(index: &TopologyIndex, source: &dyn TopologySource) -> anyhow::Result<u64> {
    let doc = source.fetch().await?;
    let snapshot = TopologySnapshot::from_document(doc)?;
    Ok(index.replace(snapshot))
}

/// Periodically refresh the index from its source
pub fn spawn_refresh(
    index: Arc<TopologyIndex>,
    source: Arc<dyn TopologySource>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // First tick fires immediately; the caller already loaded once
        interval.tick().await;
        loop {
            interval.tick().await;
            match refresh_once(&index, source.as_ref()).await {
                Ok(version) => debug!(version, "Topology refreshed"),
                Err(e) => {
                    error!("Topology refresh failed, keeping previous snapshot: {:#}", e);
                }
            }
        }
    })
}

/// Log devices whose paths disagree between two snapshots
pub fn log_path_changes(old: &TopologySnapshot, new: &TopologySnapshot) -> usize {
    let mut changed = 0;
    for (id, device) in &new.devices {
        if let Some(prev) = old.devices.get(id) {
            if prev.upstream_path != device.upstream_path {
                changed += 1;
                warn!(device = %id, "Upstream path changed");
            }
        }
    }
    changed
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two amplifiers under one fiber node, one CMTS port.
    ///
    /// ```text
    /// cmts-1 ── fn-1 ─┬─ amp-1 ─┬─ cm-a
    ///                 │         └─ cm-b
    ///                 └─ amp-2 ─── cm-c
    /// ```
    pub(crate) fn sample_document() -> TopologyDocument {
        let device = |id: &str, amp: &str| DeviceNode {
            device_id: id.into(),
            upstream_path: vec![amp.into(), "fn-1".into(), "cmts-1".into()],
            device_class: DeviceClass::CableModem,
        };
        TopologyDocument {
            nodes: vec![
                InfrastructureNode {
                    node_id: "amp-1".into(),
                    node_class: DeviceClass::Amplifier,
                },
                InfrastructureNode {
                    node_id: "amp-2".into(),
                    node_class: DeviceClass::Amplifier,
                },
                InfrastructureNode {
                    node_id: "fn-1".into(),
                    node_class: DeviceClass::FiberNode,
                },
                InfrastructureNode {
                    node_id: "cmts-1".into(),
                    node_class: DeviceClass::CmtsPort,
                },
            ],
            devices: vec![
                device("cm-a", "amp-1"),
                device("cm-b", "amp-1"),
                device("cm-c", "amp-2"),
            ],
        }
    }

    #[test]
    fn test_resolve_path_and_unknown_device() {
        let index = TopologyIndex::from_document(sample_document()).unwrap();
        assert_eq!(index.resolve_path("cm-a").unwrap(), vec!["amp-1", "fn-1", "cmts-1"]);
        assert_eq!(
            index.resolve_path("cm-z"),
            Err(PnmError::UnknownDevice("cm-z".into()))
        );
    }

    #[test]
    fn test_common_ancestor_is_nearest() {
        let index = TopologyIndex::from_document(sample_document()).unwrap();
        assert_eq!(index.common_ancestor("cm-a", "cm-b").unwrap().as_deref(), Some("amp-1"));
        assert_eq!(index.common_ancestor("cm-a", "cm-c").unwrap().as_deref(), Some("fn-1"));
        assert!(index.common_ancestor("cm-a", "nope").is_err());
    }

    #[test]
    fn test_no_common_ancestor() {
        let mut doc = sample_document();
        doc.devices.push(DeviceNode {
            device_id: "cm-far".into(),
            upstream_path: vec!["amp-9".into(), "fn-9".into(), "cmts-9".into()],
            device_class: DeviceClass::CableModem,
        });
        let snapshot = TopologySnapshot::from_document(doc).unwrap();
        assert_eq!(snapshot.common_ancestor("cm-a", "cm-far").unwrap(), None);
    }

    #[test]
    fn test_rejects_cyclic_path() {
        let mut doc = sample_document();
        doc.devices[0].upstream_path.push("amp-1".into());
        assert!(TopologySnapshot::from_document(doc).is_err());
    }

    #[test]
    fn test_replace_keeps_old_snapshot_alive() {
        let index = TopologyIndex::from_document(sample_document()).unwrap();
        let before = index.snapshot();

        let mut doc = sample_document();
        doc.devices[0].upstream_path[0] = "amp-2".into();
        let version = index.replace(TopologySnapshot::from_document(doc).unwrap());

        assert!(version > before.version());
        assert_eq!(before.resolve_path("cm-a").unwrap()[0], "amp-1");
        assert_eq!(index.resolve_path("cm-a").unwrap()[0], "amp-2");
        assert_eq!(log_path_changes(&before, &index.snapshot()), 1);
    }

    #[test]
    fn test_node_class_lookup() {
        let snapshot = TopologySnapshot::from_document(sample_document()).unwrap();
        assert_eq!(snapshot.node_class("amp-1"), DeviceClass::Amplifier);
        assert_eq!(snapshot.node_class("cm-a"), DeviceClass::CableModem);
        assert_eq!(snapshot.node_class("ghost"), DeviceClass::Unknown);
    }

    #[tokio::test]
    async fn test_file_source_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.json");
        std::fs::write(&path, serde_json::to_string(&sample_document()).unwrap()).unwrap();

        let index = TopologyIndex::empty();
        let source = FileTopologySource::new(&path);
        refresh_once(&index, &source).await.unwrap();
        assert!(index.contains_device("cm-c"));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let index = TopologyIndex::from_document(sample_document()).unwrap();
        let source = FileTopologySource::new("/nonexistent/topology.json");
        assert!(refresh_once(&index, &source).await.is_err());
        assert!(index.contains_device("cm-a"));
    }
}
