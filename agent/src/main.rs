use agent::config::{termination_log_path, AgentConfig};
use agent::drainer::DrainOrchestrator;
use agent::error::{self, Result};
use agent::notice::{MetadataNoticeSource, NoticeSource};
use agent::watcher::{TerminationWatcher, WatcherState};
use models::node::{ClusterClient, DrainBackend, K8SClusterClient, KubectlClusterClient};
use models::{constants::AGENT_NAME, telemetry};

use snafu::ResultExt;
use tracing::{event, Level};

use std::env;
use std::fs;
use std::process;

#[tokio::main]
async fn main() {
    let termination_log = termination_log_path(|name| env::var(name).ok());

    if let Err(error) = run_agent().await {
        event!(Level::ERROR, %error, "Agent exited");
        if let Err(write_error) = fs::write(&termination_log, format!("{}", error)) {
            eprintln!(
                "Could not write termination log '{}': {}. Error was: {}",
                termination_log, write_error, error
            );
        }
        process::exit(1);
    }
}

async fn run_agent() -> Result<()> {
    telemetry::init_logging_from_env().context(error::TelemetryInitSnafu)?;
    event!(Level::INFO, agent = AGENT_NAME, "Starting up");

    let config = AgentConfig::from_env().context(error::ConfigSnafu)?;
    let notice_source =
        MetadataNoticeSource::from_config(&config).context(error::NoticeSourceCreateSnafu)?;
    event!(
        Level::INFO,
        node = %config.node_name,
        notice_url = notice_source.notice_url(),
        backend = ?config.drain_backend,
        "Agent configured"
    );

    let final_state = match config.drain_backend {
        DrainBackend::Kubectl => {
            let cluster_client = KubectlClusterClient::new(&config.kubectl_path);
            watch(&config, notice_source, cluster_client).await
        }
        DrainBackend::Api => {
            let k8s_client = kube::client::Client::try_default()
                .await
                .context(error::ClientCreateSnafu)?;
            watch(&config, notice_source, K8SClusterClient::new(k8s_client)).await
        }
    };

    match final_state {
        WatcherState::Done => Ok(()),
        WatcherState::Fatal { cause } => error::DrainFailedSnafu {
            node_name: config.node_name,
            cause,
        }
        .fail(),
        state => error::AssertionSnafu {
            message: format!("Watcher stopped in non-terminal state {:?}", state),
        }
        .fail(),
    }
}

async fn watch<N, C>(config: &AgentConfig, notice_source: N, cluster_client: C) -> WatcherState
where
    N: NoticeSource,
    C: ClusterClient,
{
    let orchestrator = DrainOrchestrator::new(
        cluster_client,
        config.node_name.clone(),
        config.drain_options(),
    );
    let mut watcher = TerminationWatcher::new(
        notice_source,
        orchestrator,
        config.poll_interval,
        config.status_report_interval,
    );
    watcher.run().await
}
