//! Per-service agent runtime: one long-lived task per live service,
//! serializing its deploys, bounding its waiter queue, surviving worker
//! crashes and idle-expiring.
//!
//! Agents are addressed through the supervisor's registry by service name.
//! A crashed or expired agent is respawned transparently by
//! `ensure_started`; clients observe continuity through the cache's
//! service-state entry.

use crate::cache::{Cache, ServiceState};
use crate::orchestrator::Orchestrator;
use futures::FutureExt;
use nopea_shared::{DeployError, DeployResult, DeploySpec};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Maximum number of waiters parked behind the in-flight deploy.
const QUEUE_CAPACITY: usize = 10;

/// Pause before draining the next waiter after a worker crash; protects a
/// broken service from immediate retry storms.
const CRASH_COOLDOWN: Duration = Duration::from_secs(2);

/// Public view of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub service: String,
    /// "idle" or "deploying".
    pub status: String,
    pub deploy_count: u64,
    pub queue_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<DeployResult>,
}

enum AgentMsg {
    Deploy {
        spec: DeploySpec,
        reply: oneshot::Sender<DeployResult>,
    },
    WorkerDone {
        worker_id: String,
        result: DeployResult,
    },
    WorkerCrashed {
        worker_id: String,
        reason: String,
    },
    DequeueNext,
    Status {
        reply: oneshot::Sender<AgentStatus>,
    },
    Stop,
}

#[derive(Clone)]
struct AgentHandle {
    tx: mpsc::UnboundedSender<AgentMsg>,
}

/// Registry plus dynamic supervision for per-service agents.
#[derive(Clone)]
pub struct AgentSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    agents: Mutex<HashMap<String, AgentHandle>>,
    orchestrator: Arc<Orchestrator>,
    cache: Arc<Cache>,
    idle_timeout: Duration,
}

impl AgentSupervisor {
    pub fn new(orchestrator: Arc<Orchestrator>, cache: Arc<Cache>) -> Self {
        Self::with_idle_timeout(orchestrator, cache, Duration::from_secs(900))
    }

    pub fn with_idle_timeout(
        orchestrator: Arc<Orchestrator>,
        cache: Arc<Cache>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                agents: Mutex::new(HashMap::new()),
                orchestrator,
                cache,
                idle_timeout,
            }),
        }
    }

    /// Starts the service's agent if it is not already running. Idempotent.
    pub fn ensure_started(&self, service: &str) {
        let _ = self.ensure_agent(service);
    }

    /// Returns a live handle for the service's agent, spawning one if the
    /// service has none or its previous agent stopped.
    fn ensure_agent(&self, service: &str) -> AgentHandle {
        let mut agents = match self.inner.agents.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = agents.get(service) {
            if !handle.tx.is_closed() {
                return handle.clone();
            }
            tracing::info!(
                target: "nopea::agent",
                service,
                "agent stopped; restarting"
            );
        }
        let handle = Agent::spawn(
            service.to_string(),
            Arc::clone(&self.inner.orchestrator),
            Arc::clone(&self.inner.cache),
            self.inner.idle_timeout,
        );
        agents.insert(service.to_string(), handle.clone());
        handle
    }

    /// Blocking deploy: routes to the service's agent, which enqueues the
    /// request when busy. Returns the deploy result once the run finishes.
    pub async fn deploy(&self, service: &str, spec: DeploySpec) -> DeployResult {
        // One respawn retry covers the race where the agent idle-expires
        // between the registry lookup and the send.
        for _ in 0..2 {
            let handle = self.ensure_agent(service);
            let (reply, rx) = oneshot::channel();
            if handle
                .tx
                .send(AgentMsg::Deploy {
                    spec: spec.clone(),
                    reply,
                })
                .is_err()
            {
                continue;
            }
            match rx.await {
                Ok(result) => return result,
                Err(_) => continue,
            }
        }
        DeployResult::failure(
            nopea_shared::id::next(),
            &spec,
            DeployError::WorkerCrash {
                reason: "agent terminated before replying".to_string(),
            },
            0,
        )
    }

    /// Current status of one service's agent, if it is running.
    pub async fn status(&self, service: &str) -> Option<AgentStatus> {
        let handle = {
            let agents = match self.inner.agents.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            agents.get(service).cloned()
        }?;
        let (reply, rx) = oneshot::channel();
        handle.tx.send(AgentMsg::Status { reply }).ok()?;
        rx.await.ok()
    }

    /// Status of every live agent.
    pub async fn health(&self) -> Vec<AgentStatus> {
        let handles: Vec<(String, AgentHandle)> = {
            let agents = match self.inner.agents.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            agents
                .iter()
                .filter(|(_, h)| !h.tx.is_closed())
                .map(|(s, h)| (s.clone(), h.clone()))
                .collect()
        };
        let mut statuses = Vec::with_capacity(handles.len());
        for (_, handle) in handles {
            let (reply, rx) = oneshot::channel();
            if handle.tx.send(AgentMsg::Status { reply }).is_ok() {
                if let Ok(status) = rx.await {
                    statuses.push(status);
                }
            }
        }
        statuses.sort_by(|a, b| a.service.cmp(&b.service));
        statuses
    }

    /// Stops a service's agent immediately, dropping any queued waiters.
    /// The next `deploy` respawns it fresh.
    pub fn stop(&self, service: &str) {
        let agents = match self.inner.agents.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = agents.get(service) {
            let _ = handle.tx.send(AgentMsg::Stop);
        }
    }
}

struct CurrentDeploy {
    worker_id: String,
    reply: oneshot::Sender<DeployResult>,
    spec: DeploySpec,
    started: Instant,
}

struct Agent {
    service: String,
    orchestrator: Arc<Orchestrator>,
    cache: Arc<Cache>,
    idle_timeout: Duration,
    self_tx: mpsc::UnboundedSender<AgentMsg>,
    queue: VecDeque<(DeploySpec, oneshot::Sender<DeployResult>)>,
    current: Option<CurrentDeploy>,
    deploy_count: u64,
    last_result: Option<DeployResult>,
}

impl Agent {
    fn spawn(
        service: String,
        orchestrator: Arc<Orchestrator>,
        cache: Arc<Cache>,
        idle_timeout: Duration,
    ) -> AgentHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        // Recover the last result so clients observe continuity across
        // restarts. The deploy counter starts fresh.
        let last_result = cache
            .get_service_state(&service)
            .and_then(|state| state.last_result);
        let agent = Agent {
            service,
            orchestrator,
            cache,
            idle_timeout,
            self_tx: tx.clone(),
            queue: VecDeque::new(),
            current: None,
            deploy_count: 0,
            last_result,
        };
        tokio::spawn(agent.run(rx));
        AgentHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AgentMsg>) {
        tracing::debug!(target: "nopea::agent", service = %self.service, "agent started");
        loop {
            let idle = self.current.is_none() && self.queue.is_empty();
            let msg = if idle {
                match tokio::time::timeout(self.idle_timeout, rx.recv()).await {
                    Ok(msg) => msg,
                    Err(_) => {
                        tracing::debug!(
                            target: "nopea::agent",
                            service = %self.service,
                            "idle timeout; agent stopping"
                        );
                        break;
                    }
                }
            } else {
                rx.recv().await
            };
            let Some(msg) = msg else { break };
            if !self.handle(msg) {
                break;
            }
        }
    }

    /// Processes one message. Returns false to stop the agent.
    fn handle(&mut self, msg: AgentMsg) -> bool {
        match msg {
            AgentMsg::Deploy { spec, reply } => {
                if self.current.is_none() {
                    self.start_worker(spec, reply);
                } else if self.queue.len() < QUEUE_CAPACITY {
                    self.queue.push_back((spec, reply));
                } else {
                    tracing::warn!(
                        target: "nopea::agent",
                        service = %self.service,
                        "waiter queue full; rejecting deploy"
                    );
                    let result = DeployResult::failure(
                        nopea_shared::id::next(),
                        &spec,
                        DeployError::QueueFull,
                        0,
                    );
                    let _ = reply.send(result);
                }
            }
            AgentMsg::WorkerDone { worker_id, result } => {
                let matches = self
                    .current
                    .as_ref()
                    .map(|c| c.worker_id == worker_id)
                    .unwrap_or(false);
                if !matches {
                    // Stale message from a superseded worker.
                    return true;
                }
                let reply = self.current.take().map(|c| c.reply);
                self.finish(reply, result);
                self.dequeue_next();
            }
            AgentMsg::WorkerCrashed { worker_id, reason } => {
                let matches = self
                    .current
                    .as_ref()
                    .map(|c| c.worker_id == worker_id)
                    .unwrap_or(false);
                if !matches {
                    return true;
                }
                if let Some(current) = self.current.take() {
                    tracing::error!(
                        target: "nopea::agent",
                        service = %self.service,
                        reason = %reason,
                        "deploy worker crashed"
                    );
                    let result = DeployResult::failure(
                        nopea_shared::id::next(),
                        &current.spec,
                        DeployError::WorkerCrash { reason },
                        current.started.elapsed().as_millis() as u64,
                    );
                    self.finish(Some(current.reply), result);
                }
                // Cooldown before draining the next waiter.
                if !self.queue.is_empty() {
                    let tx = self.self_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(CRASH_COOLDOWN).await;
                        let _ = tx.send(AgentMsg::DequeueNext);
                    });
                }
            }
            AgentMsg::DequeueNext => {
                self.dequeue_next();
            }
            AgentMsg::Status { reply } => {
                let _ = reply.send(AgentStatus {
                    service: self.service.clone(),
                    status: if self.current.is_some() {
                        "deploying".to_string()
                    } else {
                        "idle".to_string()
                    },
                    deploy_count: self.deploy_count,
                    queue_length: self.queue.len(),
                    last_result: self.last_result.clone(),
                });
            }
            AgentMsg::Stop => {
                tracing::info!(target: "nopea::agent", service = %self.service, "agent stopped");
                return false;
            }
        }
        true
    }

    fn start_worker(&mut self, spec: DeploySpec, reply: oneshot::Sender<DeployResult>) {
        let worker_id = nopea_shared::id::next();
        let orchestrator = Arc::clone(&self.orchestrator);
        let tx = self.self_tx.clone();
        let worker_spec = spec.clone();
        let token = worker_id.clone();
        tokio::spawn(async move {
            let outcome = std::panic::AssertUnwindSafe(orchestrator.run(worker_spec))
                .catch_unwind()
                .await;
            let msg = match outcome {
                Ok(result) => AgentMsg::WorkerDone {
                    worker_id: token,
                    result,
                },
                Err(panic) => AgentMsg::WorkerCrashed {
                    worker_id: token,
                    reason: panic_reason(panic),
                },
            };
            let _ = tx.send(msg);
        });
        self.current = Some(CurrentDeploy {
            worker_id,
            reply,
            spec,
            started: Instant::now(),
        });
    }

    /// Replies to the waiter, bumps counters and persists the service state.
    fn finish(&mut self, reply: Option<oneshot::Sender<DeployResult>>, result: DeployResult) {
        self.deploy_count += 1;
        self.last_result = Some(result.clone());
        self.cache.put_service_state(ServiceState {
            service: self.service.clone(),
            deploy_count: self.deploy_count,
            last_result: Some(result.clone()),
            updated_at: chrono::Utc::now().to_rfc3339(),
        });
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn dequeue_next(&mut self) {
        if self.current.is_some() {
            return;
        }
        if let Some((spec, reply)) = self.queue.pop_front() {
            self.start_worker(spec, reply);
        }
    }
}

fn panic_reason(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::MockKubeClient;
    use nopea_shared::DeployStatus;

    fn supervisor(kube: Arc<MockKubeClient>) -> (AgentSupervisor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::new());
        let orch = Arc::new(
            Orchestrator::new(kube, Arc::clone(&cache)).with_state_dir(dir.path()),
        );
        (AgentSupervisor::new(orch, cache), dir)
    }

    #[tokio::test]
    async fn deploy_through_agent_completes() {
        let (sup, _dir) = supervisor(Arc::new(MockKubeClient::new()));
        let result = sup.deploy("web", DeploySpec::new("web")).await;
        assert_eq!(result.status, DeployStatus::Completed);

        let status = sup.status("web").await.unwrap();
        assert_eq!(status.deploy_count, 1);
        assert_eq!(status.status, "idle");
        assert_eq!(status.queue_length, 0);
    }

    #[tokio::test]
    async fn unknown_service_has_no_status() {
        let (sup, _dir) = supervisor(Arc::new(MockKubeClient::new()));
        assert!(sup.status("ghost").await.is_none());
    }

    #[tokio::test]
    async fn stopped_agent_restarts_fresh_but_keeps_last_result() {
        let (sup, _dir) = supervisor(Arc::new(MockKubeClient::new()));
        let first = sup.deploy("web", DeploySpec::new("web")).await;
        sup.stop("web");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = sup.status("web").await;
        assert!(status.is_none() || status.unwrap().deploy_count == 0);

        // A new deploy respawns the agent; the recovered last_result from
        // the cache covers the gap until it finishes.
        let result = sup.deploy("web", DeploySpec::new("web")).await;
        assert_eq!(result.status, DeployStatus::Completed);
        let status = sup.status("web").await.unwrap();
        assert_eq!(status.deploy_count, 1);
        assert_ne!(
            status.last_result.as_ref().unwrap().deploy_id,
            first.deploy_id
        );
    }

    #[tokio::test]
    async fn health_lists_live_agents() {
        let (sup, _dir) = supervisor(Arc::new(MockKubeClient::new()));
        sup.deploy("alpha", DeploySpec::new("alpha")).await;
        sup.deploy("beta", DeploySpec::new("beta")).await;
        let health = sup.health().await;
        let services: Vec<&str> = health.iter().map(|s| s.service.as_str()).collect();
        assert_eq!(services, vec!["alpha", "beta"]);
    }
}
