//! The watch loop: poll for a reclamation notice at a fixed interval, and drain the node once one appears.
//!
//! Notices are never rescinded, so the first one observed starts the drain. The loop never polls again after that:
//! a successful drain ends in [`WatcherState::Done`], a failed one in [`WatcherState::Fatal`], and the drain is not
//! retried.
use crate::drainer::{DrainOrchestrator, DrainResult};
use crate::notice::{NoticeSource, PollOutcome};
use models::node::ClusterClient;

use chrono::Utc;
use tokio::time::{sleep, Duration};
use tracing::{event, instrument, Level};

/// Where the watcher is in its single run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatcherState {
    /// Polling for a reclamation notice.
    Watching,
    /// A notice was observed; the node is about to be drained.
    Draining,
    /// The node was drained. Terminal.
    Done,
    /// The drain failed. Terminal.
    Fatal { cause: String },
}

impl WatcherState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WatcherState::Done | WatcherState::Fatal { .. })
    }
}

/// Rate-limits the status line logged while no notice is present.
///
/// Every quiet poll adds one poll interval to the accumulated time. Once it reaches the threshold a status line is
/// due and the accumulated time starts again from zero.
#[derive(Clone, Debug)]
pub struct QuietLogThrottle {
    elapsed: Duration,
    threshold: Duration,
    reports: u64,
}

impl QuietLogThrottle {
    pub fn new(threshold: Duration) -> Self {
        QuietLogThrottle {
            elapsed: Duration::ZERO,
            threshold,
            reports: 0,
        }
    }

    /// Records one quiet poll. Returns `true` when a status line should be logged.
    pub fn record(&mut self, poll_interval: Duration) -> bool {
        self.elapsed += poll_interval;
        if self.elapsed >= self.threshold {
            self.elapsed = Duration::ZERO;
            self.reports += 1;
            true
        } else {
            false
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Number of status lines due so far.
    pub fn reports(&self) -> u64 {
        self.reports
    }
}

pub struct TerminationWatcher<N: NoticeSource, C: ClusterClient> {
    notice_source: N,
    orchestrator: DrainOrchestrator<C>,
    poll_interval: Duration,
    throttle: QuietLogThrottle,
    state: WatcherState,
    polls: u64,
}

impl<N: NoticeSource, C: ClusterClient> TerminationWatcher<N, C> {
    pub fn new(
        notice_source: N,
        orchestrator: DrainOrchestrator<C>,
        poll_interval: Duration,
        status_report_interval: Duration,
    ) -> Self {
        TerminationWatcher {
            notice_source,
            orchestrator,
            poll_interval,
            throttle: QuietLogThrottle::new(status_report_interval),
            state: WatcherState::Watching,
            polls: 0,
        }
    }

    pub fn state(&self) -> &WatcherState {
        &self.state
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    pub fn status_reports(&self) -> u64 {
        self.throttle.reports()
    }

    /// Performs one transition of the watcher. A poll that finds no notice includes the sleep before the next poll.
    pub async fn step(&mut self) -> &WatcherState {
        self.state = match self.state.clone() {
            WatcherState::Watching => self.watch_once().await,
            WatcherState::Draining => match self.orchestrator.drain().await {
                DrainResult::Success => WatcherState::Done,
                DrainResult::Failure(cause) => WatcherState::Fatal { cause },
            },
            terminal => terminal,
        };
        &self.state
    }

    /// Runs the watcher until it reaches a terminal state, and returns that state.
    #[instrument(skip(self), fields(node = %self.orchestrator.node_name()))]
    pub async fn run(&mut self) -> WatcherState {
        event!(
            Level::INFO,
            "Watching for termination notice on node {}",
            self.orchestrator.node_name()
        );
        while !self.state.is_terminal() {
            self.step().await;
        }
        self.state.clone()
    }

    async fn watch_once(&mut self) -> WatcherState {
        let outcome = self.notice_source.poll().await;
        self.polls += 1;
        event!(Level::DEBUG, poll = self.polls, %outcome, "Polled termination notice");

        if let PollOutcome::NoticePresent { termination_time } = outcome {
            match termination_time {
                Some(time) => event!(
                    Level::WARN,
                    termination_time = %time.to_rfc3339(),
                    remaining_seconds = (time - Utc::now()).num_seconds(),
                    "Termination notice received for node {}",
                    self.orchestrator.node_name()
                ),
                None => event!(
                    Level::WARN,
                    "Termination notice received for node {}",
                    self.orchestrator.node_name()
                ),
            }
            return WatcherState::Draining;
        }

        if self.throttle.record(self.poll_interval) {
            event!(
                Level::INFO,
                "Termination notice status: {}, on Node: {}",
                outcome,
                self.orchestrator.node_name()
            );
        }
        sleep(self.poll_interval).await;
        WatcherState::Watching
    }
}
