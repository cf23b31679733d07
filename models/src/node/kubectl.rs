/*!
A `ClusterClient` which drives the cluster through the `kubectl` binary available to the agent.

Each operation is a single invocation of kubectl. Its exit status is the only signal of success. A drain's
standard output is logged line by line as kubectl prints it, and standard error is carried in the returned error.
*/
use super::{
    error::{self, Result},
    ClusterClient, DrainOptions, WorkloadRef,
};
use crate::constants::{KUBECTL, NODE_NAME_FIELD_SELECTOR};

use async_trait::async_trait;
use kube::api::ObjectMeta;
use serde::Deserialize;
use snafu::{ensure, OptionExt, ResultExt};
use std::path::PathBuf;
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{event, instrument, Level};

/// The subset of `kubectl get pods -o json` output that the agent reads.
#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodItem>,
}

#[derive(Debug, Deserialize)]
struct PodItem {
    metadata: ObjectMeta,
}

#[derive(Clone, Debug)]
pub struct KubectlClusterClient {
    kubectl_path: PathBuf,
}

impl Default for KubectlClusterClient {
    fn default() -> Self {
        KubectlClusterClient::new(KUBECTL)
    }
}

impl KubectlClusterClient {
    pub fn new<P: Into<PathBuf>>(kubectl_path: P) -> Self {
        KubectlClusterClient {
            kubectl_path: kubectl_path.into(),
        }
    }

    fn list_args(node_name: &str) -> Vec<String> {
        vec![
            "get".to_string(),
            "pods".to_string(),
            "--all-namespaces".to_string(),
            format!("--field-selector={}={}", NODE_NAME_FIELD_SELECTOR, node_name),
            "-o".to_string(),
            "json".to_string(),
        ]
    }

    fn drain_args(node_name: &str, options: &DrainOptions) -> Vec<String> {
        let mut args = vec![
            "drain".to_string(),
            node_name.to_string(),
            format!("--grace-period={}", options.grace_period.as_secs()),
        ];
        if options.force {
            args.push("--force".to_string());
        }
        if options.ignore_daemonsets {
            args.push("--ignore-daemonsets".to_string());
        }
        args
    }

    async fn invoke_kubectl(&self, node_name: &str, args: Vec<String>) -> Result<Output> {
        event!(Level::DEBUG, kubectl = ?self.kubectl_path, ?args, "Invoking kubectl");
        Command::new(&self.kubectl_path)
            .args(&args)
            .output()
            .await
            .context(error::KubectlCommandSnafu {
                program: self.kubectl_path.display().to_string(),
                args,
                node_name,
            })
    }
}

/// Logs each line of kubectl's progress output as it arrives. Returns the number of lines logged.
async fn forward_lines<R>(reader: R, node_name: &str) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;
    while let Some(line) = lines.next_line().await? {
        event!(Level::INFO, node = node_name, "kubectl: {}", line);
        forwarded += 1;
    }
    Ok(forwarded)
}

/// Parses `kubectl get pods -o json` output into the Pods it names.
fn parse_pod_list(stdout: &[u8]) -> serde_json::Result<Vec<WorkloadRef>> {
    let pod_list: PodList = serde_json::from_slice(stdout)?;
    Ok(pod_list
        .items
        .into_iter()
        .map(|item| WorkloadRef {
            namespace: item
                .metadata
                .namespace
                .unwrap_or_else(|| "default".to_string()),
            name: item.metadata.name.unwrap_or_default(),
        })
        .collect())
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl ClusterClient for KubectlClusterClient {
    #[instrument(skip(self), err)]
    async fn list_workloads(&self, node_name: &str) -> Result<Vec<WorkloadRef>> {
        let output = self
            .invoke_kubectl(node_name, Self::list_args(node_name))
            .await?;

        ensure!(
            output.status.success(),
            error::ListExitSnafu {
                node_name,
                code: output.status.code(),
                stderr: stderr_text(&output),
            }
        );

        parse_pod_list(&output.stdout).context(error::ListParseSnafu { node_name })
    }

    #[instrument(skip(self), err)]
    async fn drain_node(&self, node_name: &str, options: &DrainOptions) -> Result<()> {
        let args = Self::drain_args(node_name, options);
        event!(Level::DEBUG, kubectl = ?self.kubectl_path, ?args, "Invoking kubectl");
        let mut child = Command::new(&self.kubectl_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context(error::KubectlCommandSnafu {
                program: self.kubectl_path.display().to_string(),
                args,
                node_name,
            })?;

        let stdout = child.stdout.take().context(error::KubectlPipeSnafu {
            node_name,
            stream: "stdout",
        })?;
        let mut stderr = child.stderr.take().context(error::KubectlPipeSnafu {
            node_name,
            stream: "stderr",
        })?;

        // Both pipes are drained together so that a chatty stderr cannot stall kubectl.
        let mut stderr_buf = Vec::new();
        let (forwarded, stderr_read) = tokio::join!(
            forward_lines(BufReader::new(stdout), node_name),
            stderr.read_to_end(&mut stderr_buf)
        );
        forwarded.context(error::KubectlOutputSnafu { node_name })?;
        stderr_read.context(error::KubectlOutputSnafu { node_name })?;

        let status = child
            .wait()
            .await
            .context(error::KubectlOutputSnafu { node_name })?;
        ensure!(
            status.success(),
            error::DrainExitSnafu {
                node_name,
                code: status.code(),
                stderr: String::from_utf8_lossy(&stderr_buf).trim().to_string(),
            }
        );

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::ClusterClientError;
    use std::os::unix::fs::PermissionsExt;
    use tokio::time::Duration;

    #[test]
    fn test_list_args() {
        assert_eq!(
            KubectlClusterClient::list_args("spot-7"),
            vec![
                "get",
                "pods",
                "--all-namespaces",
                "--field-selector=spec.nodeName=spot-7",
                "-o",
                "json"
            ]
        );
    }

    #[test]
    fn test_drain_args() {
        assert_eq!(
            KubectlClusterClient::drain_args("spot-7", &DrainOptions::default()),
            vec![
                "drain",
                "spot-7",
                "--grace-period=120",
                "--force",
                "--ignore-daemonsets"
            ]
        );

        let options = DrainOptions {
            grace_period: Duration::from_secs(30),
            force: false,
            ignore_daemonsets: false,
        };
        assert_eq!(
            KubectlClusterClient::drain_args("spot-7", &options),
            vec!["drain", "spot-7", "--grace-period=30"]
        );
    }

    #[test]
    fn test_parse_pod_list() {
        let stdout = br#"{
            "apiVersion": "v1",
            "kind": "List",
            "items": [
                {"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "coredns-1", "namespace": "kube-system"}},
                {"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "worker-3", "namespace": "default"}}
            ]
        }"#;
        assert_eq!(
            parse_pod_list(stdout).unwrap(),
            vec![
                WorkloadRef::new("kube-system", "coredns-1"),
                WorkloadRef::new("default", "worker-3"),
            ]
        );

        assert!(parse_pod_list(br#"{"apiVersion": "v1", "kind": "List", "items": []}"#)
            .unwrap()
            .is_empty());
        assert!(parse_pod_list(b"No resources found").is_err());
    }

    /// Writes a shell script standing in for kubectl. Every case runs inside one test so that no other
    /// thread of this test binary can fork while a script is open for writing.
    fn fake_kubectl(dir: &std::path::Path, name: &str, script: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_kubectl_invocations() {
        let dir = tempfile::tempdir().unwrap();

        let listing = fake_kubectl(
            dir.path(),
            "listing",
            r#"echo '{"items": [{"metadata": {"name": "worker-3", "namespace": "default"}}]}'"#,
        );
        let client = KubectlClusterClient::new(&listing);
        assert_eq!(
            client.list_workloads("spot-7").await.unwrap(),
            vec![WorkloadRef::new("default", "worker-3")]
        );

        let failing = fake_kubectl(dir.path(), "failing", "echo 'forbidden' >&2\nexit 3");
        let client = KubectlClusterClient::new(&failing);
        match client.list_workloads("spot-7").await {
            Err(ClusterClientError::ListExit { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "forbidden");
            }
            other => panic!("unexpected list result: {:?}", other),
        }
        match client
            .drain_node("spot-7", &DrainOptions::default())
            .await
        {
            Err(ClusterClientError::DrainExit { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "forbidden");
            }
            other => panic!("unexpected drain result: {:?}", other),
        }

        let args_file = dir.path().join("args");
        let draining = fake_kubectl(
            dir.path(),
            "draining",
            &format!("echo \"$@\" > {}\necho 'node/spot-7 drained'", args_file.display()),
        );
        let client = KubectlClusterClient::new(&draining);
        client
            .drain_node("spot-7", &DrainOptions::default())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&args_file).unwrap().trim(),
            "drain spot-7 --grace-period=120 --force --ignore-daemonsets"
        );

        // More output on both streams than a pipe buffer holds.
        let chatty = fake_kubectl(
            dir.path(),
            "chatty",
            "i=0\nwhile [ $i -lt 2000 ]; do\n  echo \"evicting pod default/worker-$i\"\n  echo \"warning: pod default/worker-$i has no controller, deleting anyway\" >&2\n  i=$((i+1))\ndone",
        );
        let client = KubectlClusterClient::new(&chatty);
        client
            .drain_node("spot-7", &DrainOptions::default())
            .await
            .unwrap();

        let client = KubectlClusterClient::new(dir.path().join("missing"));
        assert!(matches!(
            client.list_workloads("spot-7").await,
            Err(ClusterClientError::KubectlCommand { .. })
        ));
        assert!(matches!(
            client
                .drain_node("spot-7", &DrainOptions::default())
                .await,
            Err(ClusterClientError::KubectlCommand { .. })
        ));
    }

    #[tokio::test]
    async fn test_forward_lines() {
        let progress: &[u8] = b"node/spot-7 cordoned\nevicting pod default/worker-3\nnode/spot-7 drained\n";
        assert_eq!(forward_lines(progress, "spot-7").await.unwrap(), 3);

        let unterminated: &[u8] = b"node/spot-7 cordoned\nnode/spot-7 drained";
        assert_eq!(forward_lines(unterminated, "spot-7").await.unwrap(), 2);

        let empty: &[u8] = b"";
        assert_eq!(forward_lines(empty, "spot-7").await.unwrap(), 0);
    }
}
