// agent constants
pub const AGENT_NAME: &str = "spotdrain-agent";

// Instance metadata service. The agent only ever talks to the link-local endpoint of the instance it runs on.
pub const METADATA_ENDPOINT: &str = "http://169.254.169.254";
pub const SPOT_TERMINATION_TIME_PATH: &str = "/latest/meta-data/spot/termination-time";
pub const METADATA_TOKEN_PATH: &str = "/latest/api/token";
pub const METADATA_TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
pub const METADATA_TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
pub const METADATA_TOKEN_TTL_SECONDS: u64 = 21600;

// Timing defaults, in seconds.
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;
pub const DEFAULT_STATUS_REPORT_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_DRAIN_GRACE_PERIOD_SECONDS: u64 = 120;
pub const DEFAULT_NOTICE_REQUEST_TIMEOUT_SECONDS: u64 = 2;

// Control plane
pub const KUBECTL: &str = "kubectl";
pub const NODE_NAME_FIELD_SELECTOR: &str = "spec.nodeName";

// Well-known annotation placed on static mirror Pods by the kubelet.
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
pub const DAEMONSET_KIND: &str = "DaemonSet";
