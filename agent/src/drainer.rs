//! Drains the node once a reclamation notice has been observed.
//!
//! A drain happens in two phases. The report phase lists the Pods placed on the node and logs what is about to be
//! evicted; it is best-effort and its failure never prevents the evict phase. The evict phase performs a single
//! cordon-and-drain of the node through the [`ClusterClient`].
use models::node::{ClusterClient, DrainOptions, WorkloadRef};

use std::collections::BTreeSet;
use tracing::{event, instrument, Level};

/// The outcome of a drain attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrainResult {
    Success,
    Failure(String),
}

/// A point-in-time view of the Pods on the node, for reporting only.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AffectedWorkloads {
    /// Sorted `namespace/name` of every Pod.
    pods: Vec<String>,
    /// Sorted, de-duplicated namespaces of those Pods.
    namespaces: Vec<String>,
}

impl AffectedWorkloads {
    pub fn from_workloads(workloads: &[WorkloadRef]) -> Self {
        let mut pods: Vec<String> = workloads.iter().map(WorkloadRef::to_string).collect();
        pods.sort();

        let namespaces: BTreeSet<&str> = workloads
            .iter()
            .map(|workload| workload.namespace.as_str())
            .collect();

        AffectedWorkloads {
            pods,
            namespaces: namespaces.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn pods(&self) -> &[String] {
        &self.pods
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    /// The Pods as a single space-separated line.
    pub fn pods_line(&self) -> String {
        self.pods.join(" ")
    }

    /// The namespaces as a single space-separated line.
    pub fn namespaces_line(&self) -> String {
        self.namespaces.join(" ")
    }
}

pub struct DrainOrchestrator<C: ClusterClient> {
    cluster_client: C,
    node_name: String,
    options: DrainOptions,
}

impl<C: ClusterClient> DrainOrchestrator<C> {
    pub fn new(cluster_client: C, node_name: String, options: DrainOptions) -> Self {
        DrainOrchestrator {
            cluster_client,
            node_name,
            options,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Lists and logs the Pods that are about to be evicted. Returns `None` if the Pods could not be listed.
    #[instrument(skip(self), fields(node = %self.node_name))]
    pub async fn report(&self) -> Option<AffectedWorkloads> {
        let workloads = match self.cluster_client.list_workloads(&self.node_name).await {
            Ok(workloads) => workloads,
            Err(e) => {
                event!(Level::ERROR, "Unable to fetch pod details: '{}'", e);
                return None;
            }
        };

        let affected = AffectedWorkloads::from_workloads(&workloads);
        if affected.is_empty() {
            event!(Level::INFO, "No pods found on the node {}", self.node_name);
        } else {
            event!(
                Level::INFO,
                "The following pods on the node {} will be evicted: {}",
                self.node_name,
                affected.pods_line()
            );
            event!(
                Level::INFO,
                "Draining node {}, affected namespaces: {}",
                self.node_name,
                affected.namespaces_line()
            );
        }
        Some(affected)
    }

    /// Reports the affected Pods, then drains the node exactly once.
    #[instrument(skip(self), fields(node = %self.node_name))]
    pub async fn drain(&self) -> DrainResult {
        event!(Level::INFO, "Draining node: {}", self.node_name);
        self.report().await;

        match self
            .cluster_client
            .drain_node(&self.node_name, &self.options)
            .await
        {
            Ok(()) => {
                event!(Level::INFO, "Node drain successful");
                DrainResult::Success
            }
            Err(e) => {
                event!(Level::ERROR, "Node drain failed: '{}'", e);
                DrainResult::Failure(e.to_string())
            }
        }
    }
}
