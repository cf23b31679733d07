use super::{
    drain,
    error::{self, Result},
    ClusterClient, DrainOptions, WorkloadRef,
};
use crate::constants::NODE_NAME_FIELD_SELECTOR;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams};
use snafu::ResultExt;
use tracing::{event, instrument, Level};

#[derive(Clone)]
/// Implementation of the `ClusterClient` trait which talks to the Kubernetes API server directly,
/// rather than going through kubectl.
pub struct K8SClusterClient {
    k8s_client: kube::client::Client,
}

impl K8SClusterClient {
    pub fn new(k8s_client: kube::client::Client) -> Self {
        K8SClusterClient { k8s_client }
    }
}

#[async_trait]
impl ClusterClient for K8SClusterClient {
    #[instrument(skip(self), err)]
    async fn list_workloads(&self, node_name: &str) -> Result<Vec<WorkloadRef>> {
        let pods: Api<Pod> = Api::all(self.k8s_client.clone());
        let pod_list = pods
            .list(
                &ListParams::default()
                    .fields(&format!("{}={}", NODE_NAME_FIELD_SELECTOR, node_name)),
            )
            .await
            .context(error::ListPodsSnafu { node_name })?;

        Ok(pod_list.iter().map(WorkloadRef::from).collect())
    }

    /// Marks the given node as unschedulable, then evicts its Pods.
    #[instrument(skip(self), err)]
    async fn drain_node(&self, node_name: &str, options: &DrainOptions) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        nodes
            .cordon(node_name)
            .await
            .context(error::CordonNodeSnafu { node_name })?;
        event!(Level::INFO, node = node_name, "Node cordoned");

        drain::drain_node(&self.k8s_client, node_name, options)
            .await
            .context(error::DrainPodsSnafu { node_name })?;
        Ok(())
    }
}
