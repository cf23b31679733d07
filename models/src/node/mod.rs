//! Access to the cluster control plane on behalf of a single node.
//!
//! The agent only needs two things from the orchestrator: a listing of the Pods placed on its node, and a
//! cordon-and-drain of that node. Both are expressed by the [`ClusterClient`] trait so that the orchestration
//! logic can be exercised against a mock instead of a live cluster.
mod client;
pub mod drain;
mod error;
mod kubectl;

pub use self::client::*;
pub use self::error::Error as ClusterClientError;
pub use self::kubectl::KubectlClusterClient;

use self::error::Result;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use tokio::time::Duration;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::constants::DEFAULT_DRAIN_GRACE_PERIOD_SECONDS;

#[cfg(feature = "mockall")]
use mockall::mock;

/// A Pod placed on a node, identified the way `kubectl` prints it: `namespace/name`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new<S1, S2>(namespace: S1, name: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        WorkloadRef {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&Pod> for WorkloadRef {
    fn from(pod: &Pod) -> Self {
        WorkloadRef {
            namespace: pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            name: pod.metadata.name.clone().unwrap_or_default(),
        }
    }
}

/// Parameters for draining a node, mirroring the flags of `kubectl drain`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DrainOptions {
    /// Time given to each Pod to terminate gracefully.
    pub grace_period: Duration,
    /// Evict Pods which are not managed by a controller.
    pub force: bool,
    /// Skip DaemonSet-managed Pods rather than refusing to drain.
    pub ignore_daemonsets: bool,
}

impl DrainOptions {
    pub fn with_grace_period(grace_period: Duration) -> Self {
        DrainOptions {
            grace_period,
            ..Default::default()
        }
    }
}

impl Default for DrainOptions {
    fn default() -> Self {
        DrainOptions {
            grace_period: Duration::from_secs(DEFAULT_DRAIN_GRACE_PERIOD_SECONDS),
            force: true,
            ignore_daemonsets: true,
        }
    }
}

/// Which control plane implementation the agent drives.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DrainBackend {
    /// Shell out to `kubectl`.
    #[default]
    Kubectl,
    /// Talk to the Kubernetes API server directly.
    Api,
}

impl FromStr for DrainBackend {
    type Err = serde_plain::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        serde_plain::from_str(s)
    }
}

#[async_trait]
/// A trait providing an interface to the cluster control plane. This is provided as a trait
/// in order to allow mocks to be used for testing purposes.
pub trait ClusterClient: Send + Sync {
    /// List every Pod currently placed on the given node.
    async fn list_workloads(&self, node_name: &str) -> Result<Vec<WorkloadRef>>;
    /// Cordon the given node and evict its Pods. Returns once the drain has concluded.
    async fn drain_node(&self, node_name: &str, options: &DrainOptions) -> Result<()>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock ClusterClient for use in tests.
    pub ClusterClient {}
    #[async_trait]
    impl ClusterClient for ClusterClient {
        async fn list_workloads(&self, node_name: &str) -> Result<Vec<WorkloadRef>>;
        async fn drain_node(&self, node_name: &str, options: &DrainOptions) -> Result<()>;
    }
}

#[async_trait]
impl<T> ClusterClient for Arc<T>
where
    T: ClusterClient + ?Sized,
{
    async fn list_workloads(&self, node_name: &str) -> Result<Vec<WorkloadRef>> {
        (**self).list_workloads(node_name).await
    }

    async fn drain_node(&self, node_name: &str, options: &DrainOptions) -> Result<()> {
        (**self).drain_node(node_name, options).await
    }
}
