use super::drain;

use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

/// Renders an optional process exit code, which is absent when the process was killed by a signal.
fn exit_code(code: &Option<i32>) -> String {
    code.map(|code| code.to_string())
        .unwrap_or_else(|| "none (terminated by signal)".to_string())
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display(
        "Unable to run '{} {}' for node '{}': '{}'",
        program,
        args.join(" "),
        node_name,
        source
    ))]
    KubectlCommand {
        program: String,
        args: Vec<String>,
        node_name: String,
        source: std::io::Error,
    },

    #[snafu(display("Unable to read output of kubectl for node '{}': '{}'", node_name, source))]
    KubectlOutput {
        node_name: String,
        source: std::io::Error,
    },

    #[snafu(display("kubectl was started for node '{}' without a {} pipe", node_name, stream))]
    KubectlPipe { node_name: String, stream: String },

    #[snafu(display(
        "Unable to list Pods on node '{}': kubectl exited with code {}: '{}'",
        node_name,
        exit_code(code),
        stderr
    ))]
    ListExit {
        node_name: String,
        code: Option<i32>,
        stderr: String,
    },

    #[snafu(display("Unable to parse Pods listed for node '{}': '{}'", node_name, source))]
    ListParse {
        node_name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Unable to list Pods on node '{}': '{}'", node_name, source))]
    ListPods {
        node_name: String,
        source: kube::Error,
    },

    #[snafu(display(
        "Unable to drain node '{}': kubectl exited with code {}: '{}'",
        node_name,
        exit_code(code),
        stderr
    ))]
    DrainExit {
        node_name: String,
        code: Option<i32>,
        stderr: String,
    },

    #[snafu(display("Unable to cordon node '{}': '{}'", node_name, source))]
    CordonNode {
        node_name: String,
        source: kube::Error,
    },

    #[snafu(display("Unable to drain node '{}': '{}'", node_name, source))]
    DrainPods {
        node_name: String,
        source: drain::error::DrainError,
    },
}
