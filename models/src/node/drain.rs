//! Provides an implementation for draining Pods from a Kubernetes Node, similar to `kubectl drain`.
//!
//! Draining in Kubernetes is done client side, and is a combination of "cordoning" a Node by marking it as
//! unschedulable, followed by evicting the Pods on the Node. Evictions respect PodDisruptionBudgets (PDBs).
//!
//! Cordoning is not handled here, because `kube-rs` provides `Api::cordon()`.
use super::DrainOptions;
use crate::constants::{DAEMONSET_KIND, MIRROR_POD_ANNOTATION, NODE_NAME_FIELD_SELECTOR};

use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{DeleteParams, EvictParams, ListParams},
    Api, ResourceExt,
};
use reqwest::StatusCode;
use snafu::{ensure, ResultExt};
use tokio::time::{sleep, Duration};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::{event, instrument, Level};

// Maximum number of Pods to evict concurrently. Waiting for Pods to be deleted is included in this limitation.
const CONCURRENT_EVICTIONS: usize = 5;

// When waiting for a PodDisruptionBudget to be satisfied, or if there is a server error, we stall for a fixed rate
// between eviction attempts. `kubectl drain` similarly waits 5 seconds between eviction attempts.
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

// After evictions are created, we wait for the Pods to be deleted by Kubernetes. Like `kubectl drain`, there is no
// upper bound on this wait; the grace period handed to each eviction bounds how long a Pod may take to terminate.
const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

// Some errors while attempting evictions result in retries with exponential backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(20);
const NUM_RETRIES: usize = 10;

/// Wrapper struct to provide retry configurations for evictions.
struct RetryStrategy {}
impl RetryStrategy {
    fn retry_strategy() -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .map(jitter)
            .take(NUM_RETRIES)
    }
}

impl tokio_retry::Condition<error::EvictionError> for RetryStrategy {
    fn should_retry(&mut self, error: &error::EvictionError) -> bool {
        error.should_retry()
    }
}

/// Drains a node of all pods.
///
/// Pods are selected the way `kubectl drain` selects them under the given options:
/// * Mirror Pods are always skipped; they are static and cannot be controlled.
/// * DaemonSet Pods are skipped with `ignore_daemonsets`; without it their presence fails the drain, since the
///   DaemonSet controller does not respect node cordons.
/// * Pods without a controller are evicted only with `force`; without it their presence fails the drain.
/// * Completed Pods are always evicted.
///
/// Every eviction is attempted before the result is reported. The drain fails if any Pod could not be evicted.
#[instrument(skip(k8s_client), err)]
pub(crate) async fn drain_node(
    k8s_client: &kube::Client,
    node_name: &str,
    options: &DrainOptions,
) -> Result<(), error::DrainError> {
    let target_pods = find_target_pods(k8s_client, node_name, options).await?;
    event!(
        Level::INFO,
        node = node_name,
        count = target_pods.len(),
        "Evicting pods"
    );

    let failed_pods: Vec<String> = stream::iter(target_pods)
        .map(|pod| {
            let k8s_client = k8s_client.clone();
            async move {
                match evict_pod(&k8s_client, &pod, options).await {
                    Ok(EvictionOutcome::Evicted) => {
                        wait_for_deletion(&k8s_client, &pod).await;
                        None
                    }
                    Ok(EvictionOutcome::AlreadyGone) => None,
                    Err(e) => {
                        event!(Level::ERROR, "Giving up on Pod '{}': '{}'", pod.name_any(), e);
                        Some(format!(
                            "{}/{}",
                            pod.namespace().unwrap_or_default(),
                            pod.name_any()
                        ))
                    }
                }
            }
        })
        .buffer_unordered(CONCURRENT_EVICTIONS)
        .filter_map(futures::future::ready)
        .collect()
        .await;

    ensure!(
        failed_pods.is_empty(),
        error::EvictionsFailedSnafu {
            node_name,
            pod_names: failed_pods,
        }
    );

    Ok(())
}

/// Finds all pods on a given node that are targeted for eviction during a drain.
#[instrument(skip(k8s_client), err)]
async fn find_target_pods(
    k8s_client: &kube::Client,
    node_name: &str,
    options: &DrainOptions,
) -> Result<Vec<Pod>, error::DrainError> {
    let pods: Api<Pod> = Api::all(k8s_client.clone());

    let our_pods = pods
        .list(&ListParams::default().fields(&format!("{}={}", NODE_NAME_FIELD_SELECTOR, node_name)))
        .await
        .context(error::FindTargetPodsSnafu { node_name })?;

    filter_pods(our_pods.into_iter(), options)
}

fn is_completed(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .map(|phase| phase == "Failed" || phase == "Succeeded")
        .unwrap_or(false)
}

fn is_mirror(pod: &Pod) -> bool {
    pod.annotations().contains_key(MIRROR_POD_ANNOTATION)
}

fn controller_kind(pod: &Pod) -> Option<&str> {
    pod.owner_references()
        .iter()
        .find(|reference| reference.controller == Some(true))
        .map(|reference| reference.kind.as_str())
}

/// Given a list of all pods for a given node, selects the pods to evict. Fails if the node holds pods that the
/// options forbid us from evicting.
fn filter_pods<F: Iterator<Item = Pod>>(
    pods: F,
    options: &DrainOptions,
) -> Result<Vec<Pod>, error::DrainError> {
    let mut targets = Vec::new();
    let mut daemonset_pods = Vec::new();
    let mut unmanaged_pods = Vec::new();

    for pod in pods {
        if is_mirror(&pod) {
            event!(
                Level::INFO,
                "Not draining Pod '{}': Pod is a static Mirror Pod",
                pod.name_any()
            );
            continue;
        }

        // Any completed pod can be removed.
        if is_completed(&pod) {
            targets.push(pod);
            continue;
        }

        match controller_kind(&pod) {
            Some(DAEMONSET_KIND) if options.ignore_daemonsets => {
                event!(
                    Level::INFO,
                    "Not draining Pod '{}': Pod is member of a DaemonSet",
                    pod.name_any()
                );
            }
            Some(DAEMONSET_KIND) => daemonset_pods.push(pod.name_any()),
            Some(_) => targets.push(pod),
            None if options.force => {
                event!(
                    Level::WARN,
                    "Evicting Pod '{}', which is not managed by a controller",
                    pod.name_any()
                );
                targets.push(pod);
            }
            None => unmanaged_pods.push(pod.name_any()),
        }
    }

    ensure!(
        daemonset_pods.is_empty(),
        error::DaemonSetPodsSnafu {
            pod_names: daemonset_pods
        }
    );
    ensure!(
        unmanaged_pods.is_empty(),
        error::UnmanagedPodsSnafu {
            pod_names: unmanaged_pods
        }
    );

    Ok(targets)
}

#[derive(Debug, PartialEq, Eq)]
enum EvictionOutcome {
    Evicted,
    /// The Pod no longer existed when we tried to evict it.
    AlreadyGone,
}

fn evict_params(options: &DrainOptions) -> EvictParams {
    EvictParams {
        delete_options: Some(DeleteParams {
            grace_period_seconds: Some(
                u32::try_from(options.grace_period.as_secs()).unwrap_or(u32::MAX),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[instrument(skip(k8s_client, pod), err)]
/// Create an eviction for the desired Pod.
async fn evict_pod(
    k8s_client: &kube::Client,
    pod: &Pod,
    options: &DrainOptions,
) -> Result<EvictionOutcome, error::EvictionError> {
    let pod_api = namespaced_pod_api(k8s_client, pod);
    let params = evict_params(options);

    // A 429 (TOO_MANY_REQUESTS) response means the eviction would violate a PodDisruptionBudget, and a 500 usually
    // means the budgets are misconfigured. Both are retried at a fixed interval until the API accepts the eviction.
    // See https://kubernetes.io/docs/tasks/administer-cluster/safely-drain-node/#stuck-evictions for details.
    RetryIf::spawn(
        RetryStrategy::retry_strategy(),
        || async {
            loop {
                event!(Level::INFO, "Attempting to evict pod {}", pod.name_any());
                let eviction_result = pod_api.evict(&pod.name_any(), &params).await;

                match eviction_result {
                    Ok(_) => {
                        event!(Level::INFO, "Successfully evicted Pod '{}'", pod.name_any());
                        return Ok(EvictionOutcome::Evicted);
                    }
                    Err(kube::Error::Api(e)) => match StatusCode::from_u16(e.code) {
                        Ok(StatusCode::TOO_MANY_REQUESTS) => {
                            event!(
                                Level::WARN,
                                "Too many requests when creating Eviction for Pod '{}': '{}'. This is likely due to respecting a Pod Disruption Budget. Retrying in {:.2}s.",
                                pod.name_any(),
                                e,
                                EVICTION_RETRY_INTERVAL.as_secs_f64()
                            );
                            sleep(EVICTION_RETRY_INTERVAL).await;
                        }
                        Ok(StatusCode::INTERNAL_SERVER_ERROR) => {
                            event!(
                                Level::ERROR,
                                "Error when evicting Pod '{}': '{}'. Check for misconfigured PodDisruptionBudgets. Retrying in {:.2}s.",
                                pod.name_any(),
                                e,
                                EVICTION_RETRY_INTERVAL.as_secs_f64()
                            );
                            sleep(EVICTION_RETRY_INTERVAL).await;
                        }
                        Ok(StatusCode::NOT_FOUND) => {
                            event!(Level::INFO, "Pod '{}' is already gone", pod.name_any());
                            return Ok(EvictionOutcome::AlreadyGone);
                        }
                        Ok(StatusCode::FORBIDDEN) => {
                            return Err(error::EvictionError::NonRetriableEviction {
                                source: kube::Error::Api(e),
                                pod_name: pod.name_any(),
                            });
                        }
                        _ => {
                            event!(
                                Level::ERROR,
                                "Error when evicting Pod '{}': '{}'.",
                                pod.name_any(),
                                e
                            );
                            return Err(error::EvictionError::RetriableEviction {
                                source: kube::Error::Api(e),
                                pod_name: pod.name_any(),
                            });
                        }
                    },
                    Err(e) => {
                        event!(Level::ERROR, "Eviction failed: '{}'. Retrying...", e);
                        return Err(error::EvictionError::RetriableEviction {
                            source: e,
                            pod_name: pod.name_any(),
                        });
                    }
                }
            }
        },
        RetryStrategy {},
    )
    .await
}

#[instrument(skip(k8s_client, pod))]
/// Wait for the given Pod to be deleted by Kubernetes. A Pod of the same name but a different UID counts as deleted.
async fn wait_for_deletion(k8s_client: &kube::Client, pod: &Pod) {
    let pod_api = namespaced_pod_api(k8s_client, pod);
    loop {
        match pod_api.get(&pod.name_any()).await {
            Err(kube::Error::Api(e)) if e.code == 404 => {
                event!(Level::INFO, "Pod {} deleted.", pod.name_any());
                break;
            }
            Ok(current) if current.uid() != pod.uid() => {
                event!(Level::INFO, "Pod {} deleted and replaced.", pod.name_any());
                break;
            }
            Ok(_) => {
                event!(
                    Level::DEBUG,
                    "Pod '{}' not yet deleted. Waiting {}s.",
                    pod.name_any(),
                    DELETION_CHECK_INTERVAL.as_secs_f64()
                );
            }
            Err(e) => {
                event!(
                    Level::ERROR,
                    "Could not determine if Pod '{}' has been deleted: '{}'. Waiting {}s.",
                    pod.name_any(),
                    e,
                    DELETION_CHECK_INTERVAL.as_secs_f64()
                );
            }
        }
        sleep(DELETION_CHECK_INTERVAL).await;
    }
}

/// Creates a kube::Api<Pod> for interacting with Pods in the namespace associated with the given Pod.
fn namespaced_pod_api(k8s_client: &kube::Client, pod: &Pod) -> Api<Pod> {
    match pod.metadata.namespace.as_ref() {
        Some(ns) => Api::namespaced(k8s_client.clone(), ns),
        None => Api::default_namespaced(k8s_client.clone()),
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum DrainError {
        #[snafu(display("Unable to find drainable Pods for Node '{}': '{}'", node_name, source))]
        FindTargetPods {
            source: kube::Error,
            node_name: String,
        },

        #[snafu(display(
            "Cannot drain DaemonSet-managed Pods without ignoring DaemonSets: {}",
            pod_names.join(", ")
        ))]
        DaemonSetPods { pod_names: Vec<String> },

        #[snafu(display(
            "Cannot drain Pods not managed by a controller without force: {}",
            pod_names.join(", ")
        ))]
        UnmanagedPods { pod_names: Vec<String> },

        #[snafu(display(
            "Unable to evict all Pods from Node '{}'; failed: {}",
            node_name,
            pod_names.join(", ")
        ))]
        EvictionsFailed {
            node_name: String,
            pod_names: Vec<String>,
        },
    }

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum EvictionError {
        #[snafu(display("Unable to create eviction for Pod '{}': '{}'", pod_name, source))]
        /// An error occurred while attempting to evict a Pod. This may result in an attempt to retry the eviction.
        RetriableEviction {
            source: kube::Error,
            pod_name: String,
        },

        #[snafu(display("Unable to create eviction for Pod '{}': '{}'", pod_name, source))]
        /// A fatal error occurred while attempting to evict a Pod. This will not be retried.
        NonRetriableEviction {
            source: kube::Error,
            pod_name: String,
        },
    }

    impl EvictionError {
        pub fn should_retry(&self) -> bool {
            match self {
                Self::RetriableEviction { .. } => true,
                Self::NonRetriableEviction { .. } => false,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(name: &str, controller: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                owner_references: controller.map(|kind| {
                    vec![OwnerReference {
                        kind: kind.to_string(),
                        name: format!("{}-owner", name),
                        controller: Some(true),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn mirror_pod(name: &str) -> Pod {
        let mut pod = pod(name, None);
        pod.metadata.annotations = Some(BTreeMap::from([(
            MIRROR_POD_ANNOTATION.to_string(),
            "hash".to_string(),
        )]));
        pod
    }

    fn completed_pod(name: &str) -> Pod {
        let mut pod = pod(name, None);
        pod.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        pod
    }

    fn names(pods: Vec<Pod>) -> Vec<String> {
        pods.iter().map(|pod| pod.name_any()).collect()
    }

    #[test]
    fn test_filter_pods_default_options() {
        let pods = vec![
            pod("web-1", Some("ReplicaSet")),
            pod("fluentd-1", Some(DAEMONSET_KIND)),
            mirror_pod("kube-proxy-1"),
            pod("bare-1", None),
            completed_pod("job-1"),
        ];

        let targets = filter_pods(pods.into_iter(), &DrainOptions::default()).unwrap();
        assert_eq!(names(targets), vec!["web-1", "bare-1", "job-1"]);
    }

    #[test]
    fn test_filter_pods_refuses_daemonsets_when_not_ignored() {
        let options = DrainOptions {
            ignore_daemonsets: false,
            ..Default::default()
        };
        let pods = vec![pod("web-1", Some("ReplicaSet")), pod("fluentd-1", Some(DAEMONSET_KIND))];

        match filter_pods(pods.into_iter(), &options) {
            Err(error::DrainError::DaemonSetPods { pod_names }) => {
                assert_eq!(pod_names, vec!["fluentd-1"])
            }
            other => panic!("unexpected filter result: {:?}", other.map(names)),
        }
    }

    #[test]
    fn test_filter_pods_refuses_unmanaged_without_force() {
        let options = DrainOptions {
            force: false,
            ..Default::default()
        };
        let pods = vec![pod("bare-1", None), completed_pod("job-1")];

        match filter_pods(pods.into_iter(), &options) {
            Err(error::DrainError::UnmanagedPods { pod_names }) => {
                assert_eq!(pod_names, vec!["bare-1"])
            }
            other => panic!("unexpected filter result: {:?}", other.map(names)),
        }
    }

    #[test]
    fn test_evict_params_carry_grace_period() {
        let params = evict_params(&DrainOptions::with_grace_period(Duration::from_secs(45)));
        assert_eq!(
            params.delete_options.and_then(|d| d.grace_period_seconds),
            Some(45)
        );

        // Out-of-range grace periods saturate rather than wrap.
        let params = evict_params(&DrainOptions::with_grace_period(Duration::from_secs(
            u32::MAX as u64 + 121,
        )));
        assert_eq!(
            params.delete_options.and_then(|d| d.grace_period_seconds),
            Some(u32::MAX)
        );
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "eviction refused".to_string(),
            reason: "Refused".to_string(),
            code,
        })
    }

    #[test]
    fn test_eviction_retry_condition() {
        let mut strategy = RetryStrategy {};
        let retriable = error::EvictionError::RetriableEviction {
            source: api_error(503),
            pod_name: "web-1".to_string(),
        };
        let fatal = error::EvictionError::NonRetriableEviction {
            source: api_error(403),
            pod_name: "web-1".to_string(),
        };
        assert!(tokio_retry::Condition::should_retry(&mut strategy, &retriable));
        assert!(!tokio_retry::Condition::should_retry(&mut strategy, &fatal));
    }
}
