//! Core data models for the resource outbox

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// String map used for labels, annotations and metric dimensions.
///
/// Ordered so that the serialized form (and therefore the stored size) is stable.
pub type LabelMap = BTreeMap<String, String>;

/// Kind of cluster resource a record describes.
///
/// The discriminants are the values persisted in the `kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(i64)]
pub enum ResourceKind {
    #[default]
    Unknown = 0,
    Deployment = 1,
    StatefulSet = 2,
    Pod = 3,
    Node = 4,
    Namespace = 5,
    Job = 6,
    CronJob = 7,
    DaemonSet = 8,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 9] = [
        ResourceKind::Unknown,
        ResourceKind::Deployment,
        ResourceKind::StatefulSet,
        ResourceKind::Pod,
        ResourceKind::Node,
        ResourceKind::Namespace,
        ResourceKind::Job,
        ResourceKind::CronJob,
        ResourceKind::DaemonSet,
    ];

    /// Value stored in the database
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Decode a stored value; unrecognised codes map to `Unknown`
    pub fn from_code(code: i64) -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .unwrap_or(ResourceKind::Unknown)
    }

    /// Name used inside series names and the `resource_type` dimension
    pub fn metric_name(self) -> &'static str {
        match self {
            ResourceKind::Unknown => "unknown",
            ResourceKind::Deployment => "deployment",
            ResourceKind::StatefulSet => "statefulset",
            ResourceKind::Pod => "pod",
            ResourceKind::Node => "node",
            ResourceKind::Namespace => "namespace",
            ResourceKind::Job => "job",
            ResourceKind::CronJob => "cronjob",
            ResourceKind::DaemonSet => "daemonset",
        }
    }

    /// Whether resources of this kind live outside any namespace
    pub fn is_cluster_scoped(self) -> bool {
        matches!(self, ResourceKind::Node | ResourceKind::Namespace)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metric_name())
    }
}

/// The fixed identifying dimensions attached to every series of a resource.
///
/// Workloads get `workload`, pods `pod`, nodes `node`; everything namespaced
/// also carries `namespace`.
pub fn standard_metric_labels(kind: ResourceKind, name: &str, namespace: Option<&str>) -> LabelMap {
    let mut labels = LabelMap::new();
    match kind {
        ResourceKind::Pod => {
            labels.insert("pod".to_string(), name.to_string());
        }
        ResourceKind::Node => {
            labels.insert("node".to_string(), name.to_string());
        }
        ResourceKind::Namespace => {
            labels.insert("namespace".to_string(), name.to_string());
        }
        _ => {
            labels.insert("workload".to_string(), name.to_string());
        }
    }
    if let Some(ns) = namespace {
        labels.insert("namespace".to_string(), ns.to_string());
    }
    labels.insert("resource_type".to_string(), kind.metric_name().to_string());
    labels
}

/// One row of the outbox: the tracked metadata of one logical cluster resource.
///
/// `(kind, name, namespace)` is the identity. `id`, `record_created`,
/// `record_updated` and `size` are owned by the store and overwritten on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: Option<String>,
    /// Filtered labels; `None` when labels are not tracked for this kind
    pub labels: Option<LabelMap>,
    /// Filtered annotations; `None` when annotations are not tracked for this kind
    pub annotations: Option<LabelMap>,
    pub metric_labels: LabelMap,
    pub record_created: DateTime<Utc>,
    pub record_updated: DateTime<Utc>,
    /// Last confirmed delivery; `None` until delivered since the last mutation
    pub sent_at: Option<DateTime<Utc>>,
    /// Byte estimate of the record's payload contribution, computed by the store
    pub size: usize,
}

impl ResourceRecord {
    /// A fresh, unsaved record carrying the standard metric labels for its kind.
    pub fn new(kind: ResourceKind, name: impl Into<String>, namespace: Option<String>) -> Self {
        let name = name.into();
        let metric_labels = standard_metric_labels(kind, &name, namespace.as_deref());
        Self {
            id: String::new(),
            kind,
            name,
            namespace,
            labels: None,
            annotations: None,
            metric_labels,
            record_created: DateTime::<Utc>::UNIX_EPOCH,
            record_updated: DateTime::<Utc>::UNIX_EPOCH,
            sent_at: None,
            size: 0,
        }
    }

    pub fn with_labels(mut self, labels: LabelMap) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_annotations(mut self, annotations: LabelMap) -> Self {
        self.annotations = Some(annotations);
        self
    }

    pub fn with_metric_labels(mut self, metric_labels: LabelMap) -> Self {
        self.metric_labels = metric_labels;
        self
    }

    /// Namespace as used in the uniqueness key (empty for cluster-scoped rows)
    pub fn namespace_key(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }

    /// Not yet confirmed delivered since its last mutation
    pub fn is_pending(&self) -> bool {
        match self.sent_at {
            None => true,
            Some(sent_at) => self.record_updated > sent_at,
        }
    }

    /// Delivered, and every timestamp is older than `cutoff`
    pub fn is_reclaimable(&self, cutoff: DateTime<Utc>) -> bool {
        match self.sent_at {
            None => false,
            Some(sent_at) => {
                sent_at < cutoff && self.record_created < cutoff && self.record_updated < cutoff
            }
        }
    }

    /// Sample timestamp for this record's series
    pub fn last_observed(&self) -> DateTime<Utc> {
        self.record_updated.max(self.record_created)
    }
}

/// Build a [`LabelMap`] from string pairs.
pub fn label_map<K, V, I>(pairs: I) -> LabelMap
where
    K: Into<String>,
    V: Into<String>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
