//! Poll `connect` until the farm converges.
//!
//! Every tick re-issues the scaling request, so a stack that finished an
//! update in between gets its next reconcile step applied.

use std::future::Future;
use std::time::Duration;

use bf_core::{AuthInfo, ConnectResponse, FarmStatus, ScaleReport};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::endpoint::ControlClient;
use crate::error::{ClientError, ClientResult};

/// Something that can answer a `connect` request.
pub trait ControlEndpoint {
    fn connect(
        &self,
        worker_count: u32,
        force_update: bool,
    ) -> impl Future<Output = ClientResult<ConnectResponse>> + Send;
}

impl ControlEndpoint for ControlClient {
    async fn connect(&self, worker_count: u32, force_update: bool) -> ClientResult<ConnectResponse> {
        ControlClient::connect(self, Some(worker_count), force_update).await
    }
}

/// Delay schedule and overall bound of the polling loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    /// Growth factor applied to the delay after each tick. `1.0` keeps it fixed.
    pub multiplier: f64,
    /// `None` polls until cancelled.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5)).with_timeout(Some(Duration::from_secs(30 * 60)))
    }
}

impl RetryPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            multiplier: 1.0,
            timeout: None,
        }
    }

    pub fn with_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.multiplier = multiplier.max(1.0);
        self.max_interval = max_interval.max(self.interval);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay following `current`, capped at `max_interval`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub worker_count: u32,
    pub force_update: bool,
}

/// A converged farm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    pub status: FarmStatus,
    pub auth_info: Option<AuthInfo>,
}

impl Ready {
    /// Address of the remote executor. Always present on a converged farm.
    pub fn remote_executor(&self) -> &str {
        self.status.remote_executor.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    /// `last` is the most recent report, if any request completed.
    #[error("farm did not converge within {waited:?}")]
    TimedOut {
        waited: Duration,
        last: Option<Box<ScaleReport>>,
    },

    #[error("cancelled while waiting for the farm")]
    Cancelled,

    #[error(transparent)]
    Endpoint(#[from] ClientError),
}

/// Why a wait ended before the awaited future.
enum Interrupted {
    Deadline,
    Cancelled,
}

/// Cancellation and deadline shared by every await of one poll.
struct Guard {
    cancel: watch::Receiver<bool>,
    /// Cleared once the sender is gone and nobody can cancel any more.
    cancellable: bool,
    deadline: Option<Instant>,
}

impl Guard {
    async fn run<F: Future>(&mut self, fut: F) -> Result<F::Output, Interrupted> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                _ = sleep_until(self.deadline) => return Err(Interrupted::Deadline),
                changed = self.cancel.changed(), if self.cancellable => match changed {
                    Ok(()) if *self.cancel.borrow() => return Err(Interrupted::Cancelled),
                    Ok(()) => {}
                    Err(_) => self.cancellable = false,
                },
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct ConvergencePoller<E> {
    endpoint: E,
    policy: RetryPolicy,
}

impl<E: ControlEndpoint> ConvergencePoller<E> {
    pub fn new(endpoint: E, policy: RetryPolicy) -> Self {
        Self { endpoint, policy }
    }

    /// Issue `connect` until the farm is usable.
    ///
    /// Endpoint errors end the loop immediately. The timeout and `cancel`
    /// both apply to in-flight requests as well as to the waits between
    /// them.
    pub async fn wait_for_ready(
        &self,
        request: ConnectRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<Ready, PollError> {
        let started = Instant::now();
        let mut guard = Guard {
            cancel,
            cancellable: true,
            deadline: self.policy.timeout.map(|t| started + t),
        };
        let mut delay = self.policy.interval;
        let mut last = None;

        let interrupted = loop {
            if *guard.cancel.borrow() {
                return Err(PollError::Cancelled);
            }

            let connect = self
                .endpoint
                .connect(request.worker_count, request.force_update);
            let response = match guard.run(connect).await {
                Ok(response) => response?,
                Err(interrupted) => break interrupted,
            };
            let report = response.status;
            info!(
                server_status = %report.server_status,
                workers_status = %report.workers_status,
                running_servers = report.status.running_servers,
                pending_servers = report.status.pending_servers,
                running_workers = report.status.running_workers,
                pending_workers = report.status.pending_workers,
                remote_executor = report.status.remote_executor.as_deref().unwrap_or("NULL"),
                "farm status"
            );
            if report.is_converged() {
                return Ok(Ready {
                    status: report.status,
                    auth_info: response.auth_info,
                });
            }
            last = Some(Box::new(report));

            if let Err(interrupted) = guard.run(tokio::time::sleep(delay)).await {
                break interrupted;
            }
            delay = self.policy.next_delay(delay);
        };

        match interrupted {
            Interrupted::Cancelled => Err(PollError::Cancelled),
            Interrupted::Deadline => {
                let waited = started.elapsed();
                warn!(?waited, "farm did not converge");
                Err(PollError::TimedOut { waited, last })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use bf_core::{FleetCounts, ReconcileOutcome};

    use super::*;

    fn report(running_workers: u32, server_ip: Option<&str>, workers: ReconcileOutcome) -> ConnectResponse {
        let servers = FleetCounts {
            running: u32::from(server_ip.is_some()),
            ..FleetCounts::default()
        };
        let fleet = FleetCounts {
            running: running_workers,
            ..FleetCounts::default()
        };
        ConnectResponse {
            status: ScaleReport {
                status: FarmStatus::new(servers, fleet, server_ip.map(str::to_string)),
                server_status: ReconcileOutcome::UpToDate,
                workers_status: workers,
            },
            auth_info: None,
        }
    }

    /// Replays scripted responses, repeating the last one forever.
    struct Scripted {
        responses: Mutex<VecDeque<ConnectResponse>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(responses: Vec<ConnectResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    impl ControlEndpoint for &Scripted {
        async fn connect(&self, _: u32, _: bool) -> ClientResult<ConnectResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.pop_front().unwrap())
            } else {
                Ok(responses.front().cloned().unwrap())
            }
        }
    }

    struct Failing;

    impl ControlEndpoint for Failing {
        async fn connect(&self, _: u32, _: bool) -> ClientResult<ConnectResponse> {
            Err(ClientError::Remote {
                status: 500,
                message: "boom".to_string(),
            })
        }
    }

    /// Accepts the request and never answers.
    struct Silent;

    impl ControlEndpoint for Silent {
        async fn connect(&self, _: u32, _: bool) -> ClientResult<ConnectResponse> {
            std::future::pending().await
        }
    }

    const REQUEST: ConnectRequest = ConnectRequest {
        worker_count: 2,
        force_update: false,
    };

    fn fast() -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(5)).with_timeout(Some(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn returns_once_converged() {
        let endpoint = Scripted::new(vec![
            report(0, None, ReconcileOutcome::WaitingForPrecondition),
            report(0, Some("1.2.3.4"), ReconcileOutcome::Creating),
            report(2, Some("1.2.3.4"), ReconcileOutcome::UpToDate),
        ]);
        let (_tx, rx) = watch::channel(false);

        let ready = ConvergencePoller::new(&endpoint, fast())
            .wait_for_ready(REQUEST, rx)
            .await
            .unwrap();
        assert_eq!(ready.remote_executor(), "1.2.3.4:8098");
        assert_eq!(ready.status.running_workers, 2);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn running_workers_alone_are_not_enough() {
        let endpoint = Scripted::new(vec![
            report(2, Some("1.2.3.4"), ReconcileOutcome::Updating),
            report(2, Some("1.2.3.4"), ReconcileOutcome::UpToDate),
        ]);
        let (_tx, rx) = watch::channel(false);

        ConvergencePoller::new(&endpoint, fast())
            .wait_for_ready(REQUEST, rx)
            .await
            .unwrap();
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn times_out_with_last_report() {
        let endpoint = Scripted::new(vec![report(0, None, ReconcileOutcome::WaitingForPrecondition)]);
        let (_tx, rx) = watch::channel(false);
        let policy = RetryPolicy::fixed(Duration::from_millis(5))
            .with_timeout(Some(Duration::from_millis(30)));

        let err = ConvergencePoller::new(&endpoint, policy)
            .wait_for_ready(REQUEST, rx)
            .await
            .unwrap_err();
        match err {
            PollError::TimedOut { waited, last } => {
                assert!(waited >= Duration::from_millis(30));
                let last = last.unwrap();
                assert_eq!(last.workers_status, ReconcileOutcome::WaitingForPrecondition);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(endpoint.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let endpoint = Scripted::new(vec![report(0, None, ReconcileOutcome::WaitingForPrecondition)]);
        let (tx, rx) = watch::channel(false);
        let policy = RetryPolicy::fixed(Duration::from_secs(60)).with_timeout(None);

        let poller = ConvergencePoller::new(&endpoint, policy);
        let wait = poller.wait_for_ready(REQUEST, rx);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(wait, cancel);

        assert!(matches!(result, Err(PollError::Cancelled)));
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_cancelled_does_not_call() {
        let endpoint = Scripted::new(vec![report(2, Some("1.2.3.4"), ReconcileOutcome::UpToDate)]);
        let (_tx, rx) = watch::channel(true);

        let result = ConvergencePoller::new(&endpoint, fast())
            .wait_for_ready(REQUEST, rx)
            .await;
        assert!(matches!(result, Err(PollError::Cancelled)));
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropped_sender_keeps_polling() {
        let endpoint = Scripted::new(vec![
            report(0, None, ReconcileOutcome::WaitingForPrecondition),
            report(1, Some("1.2.3.4"), ReconcileOutcome::UpToDate),
        ]);
        let (tx, rx) = watch::channel(false);
        drop(tx);

        let ready = ConvergencePoller::new(&endpoint, fast())
            .wait_for_ready(REQUEST, rx)
            .await
            .unwrap();
        assert_eq!(ready.status.running_workers, 1);
    }

    #[tokio::test]
    async fn endpoint_errors_stop_the_loop() {
        let (_tx, rx) = watch::channel(false);
        let err = ConvergencePoller::new(Failing, fast())
            .wait_for_ready(REQUEST, rx)
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Endpoint(ClientError::Remote { status: 500, .. })));
    }

    #[tokio::test]
    async fn timeout_bounds_an_unanswered_request() {
        let (_tx, rx) = watch::channel(false);
        let policy = RetryPolicy::fixed(Duration::from_millis(5))
            .with_timeout(Some(Duration::from_millis(50)));

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            ConvergencePoller::new(Silent, policy).wait_for_ready(REQUEST, rx),
        )
        .await
        .expect("poller must give up on its own");
        match result {
            Err(PollError::TimedOut { waited, last }) => {
                assert!(waited >= Duration::from_millis(50));
                assert!(last.is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_an_unanswered_request() {
        let (tx, rx) = watch::channel(false);
        let policy = RetryPolicy::fixed(Duration::from_millis(5)).with_timeout(None);

        let poller = ConvergencePoller::new(Silent, policy);
        let wait = poller.wait_for_ready(REQUEST, rx);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(wait, cancel)
        })
        .await
        .expect("cancel must end the poll");
        assert!(matches!(result, Err(PollError::Cancelled)));
    }

    #[test]
    fn backoff_grows_to_the_cap() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1)).with_backoff(2.0, Duration::from_secs(5));
        let mut delay = policy.interval;
        let mut seen = Vec::new();
        for _ in 0..4 {
            delay = policy.next_delay(delay);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 5, 5]);
        assert_eq!(RetryPolicy::default().next_delay(Duration::from_secs(5)), Duration::from_secs(5));
    }
}
