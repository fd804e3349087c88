/// Backend Client: owns one node-facing long-poll loop plus the subscriber
/// registry for one mining dialect (ProgPoW or RandomX).
use crate::job::{self, Algo, Job, TemplateError};
use crate::rpc::{NodeRpc, RpcCallError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct BackendState {
    pub subscribers: HashMap<Uuid, mpsc::UnboundedSender<Arc<Job>>>,
    pub last_job: Option<Arc<Job>>,
}

pub struct BackendClient {
    algo: Algo,
    rpc: NodeRpc,
    state: Mutex<BackendState>,
    submission_counter: AtomicU64,
    successful_submission_counter: AtomicU64,
    log_jobs: bool,
}

impl BackendClient {
    pub fn new(algo: Algo, rpc: NodeRpc, log_jobs: bool) -> Arc<Self> {
        Arc::new(Self {
            algo,
            rpc,
            state: Mutex::new(BackendState {
                subscribers: HashMap::new(),
                last_job: None,
            }),
            submission_counter: AtomicU64::new(0),
            successful_submission_counter: AtomicU64::new(0),
            log_jobs,
        })
    }

    pub fn algo(&self) -> Algo {
        self.algo
    }

    /// Registers a subscriber and returns the current job, if any, so the
    /// caller can deliver it immediately without waiting on the next poll.
    pub async fn subscribe(&self, id: Uuid, tx: mpsc::UnboundedSender<Arc<Job>>) -> Option<Arc<Job>> {
        let mut state = self.state.lock().await;
        state.subscribers.insert(id, tx);
        state.last_job.clone()
    }

    pub async fn unsubscribe(&self, id: &Uuid) {
        self.state.lock().await.subscribers.remove(id);
    }

    pub async fn last_job(&self) -> Option<Arc<Job>> {
        self.state.lock().await.last_job.clone()
    }

    pub fn submission_counter(&self) -> u64 {
        self.submission_counter.load(Ordering::SeqCst)
    }

    pub fn successful_submission_counter(&self) -> u64 {
        self.successful_submission_counter.load(Ordering::SeqCst)
    }

    /// Runs until `cancel` fires. Fetches `getblocktemplate` with the prior
    /// `longpollid` piggybacked, detects template changes, and fans the new
    /// job out to every subscriber over its own unbounded channel so a
    /// stalled subscriber never backs up another.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut longpollid: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let mut req_params = serde_json::Map::new();
            req_params.insert("algo".to_string(), json!(self.algo.tag()));
            if let Some(id) = &longpollid {
                req_params.insert("longpollid".to_string(), json!(id));
            }
            let params = json!([Value::Object(req_params)]);

            let resp = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                r = self.rpc.call("getblocktemplate", params) => r,
            };

            let raw = match resp {
                Ok(v) => v,
                Err(RpcCallError::Unauthorized) => {
                    tracing::error!(
                        algo = self.algo.tag(),
                        "node rejected credentials (401), retrying in 10s"
                    );
                    self.sleep_or_cancel(Duration::from_secs(10), &cancel).await;
                    continue;
                }
                Err(RpcCallError::Transport(msg)) => {
                    tracing::warn!(
                        algo = self.algo.tag(),
                        error = %msg,
                        "transport error talking to node, retrying in 1s"
                    );
                    self.sleep_or_cancel(Duration::from_secs(1), &cancel).await;
                    continue;
                }
            };

            if raw.get("error").is_some_and(|e| !e.is_null()) {
                tracing::warn!(
                    algo = self.algo.tag(),
                    error = %raw["error"],
                    "node returned an RPC-level error, retrying in 1s"
                );
                self.sleep_or_cancel(Duration::from_secs(1), &cancel).await;
                continue;
            }

            let result = match raw.get("result") {
                Some(r) => r,
                None => {
                    tracing::warn!(
                        algo = self.algo.tag(),
                        "getblocktemplate response missing result, retrying in 1s"
                    );
                    self.sleep_or_cancel(Duration::from_secs(1), &cancel).await;
                    continue;
                }
            };

            let parsed = match self.algo {
                Algo::Progpow => job::parse_progpow_template(result).map(Job::Progpow),
                Algo::RandomX => job::parse_randomx_template(result).map(Job::RandomX),
            };

            let new_job = match parsed {
                Ok(j) => j,
                Err(TemplateError::Fatal(msg)) => {
                    tracing::error!(algo = self.algo.tag(), reason = %msg, "fatal backend misconfiguration");
                    std::process::exit(1);
                }
                Err(TemplateError::Invalid(msg)) => {
                    tracing::warn!(algo = self.algo.tag(), reason = %msg, "malformed template, retrying in 1s");
                    self.sleep_or_cancel(Duration::from_secs(1), &cancel).await;
                    continue;
                }
            };

            if longpollid.as_deref() == Some(new_job.longpollid()) {
                continue;
            }
            longpollid = Some(new_job.longpollid().to_string());

            let new_job = Arc::new(new_job);
            {
                let mut state = self.state.lock().await;
                state.last_job = Some(new_job.clone());
                for tx in state.subscribers.values() {
                    let _ = tx.send(new_job.clone());
                }
            }
            let diff = job::format_diff(new_job.target());
            if self.log_jobs {
                tracing::info!(
                    algo = self.algo.tag(),
                    height = new_job.height(),
                    job_id = new_job.job_id(),
                    diff = diff.as_deref().unwrap_or("?"),
                    "new job"
                );
            } else {
                tracing::debug!(
                    algo = self.algo.tag(),
                    height = new_job.height(),
                    job_id = new_job.job_id(),
                    diff = diff.as_deref().unwrap_or("?"),
                    "new job"
                );
            }
        }
    }

    async fn sleep_or_cancel(&self, dur: Duration, cancel: &CancellationToken) {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(dur) => {}
        }
    }

    /// Submits a share or block to the node.
    ///
    /// `Ok(())` on acceptance. `Err` carries a JSON-RPC error object ready to
    /// relay verbatim to the client: the node's own `error` field when
    /// present, `{code:26}` when the node's `result` is truthy but not
    /// literally `true` (rejected with a reason payload), `{code:25}`
    /// otherwise, and `{code:24}` on a transport failure.
    pub async fn submit(&self, method: &str, params: Value) -> Result<(), Value> {
        self.submission_counter.fetch_add(1, Ordering::SeqCst);
        let total = self.submission_counter();

        let resp = match self.rpc.call(method, params).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    algo = self.algo.tag(),
                    error = %e,
                    successful = self.successful_submission_counter(),
                    total,
                    "submission failed: transport error"
                );
                return Err(json!({ "code": 24, "message": e.to_string() }));
            }
        };

        if let Some(err) = resp.get("error").filter(|e| !e.is_null()) {
            tracing::warn!(
                algo = self.algo.tag(),
                error = %err,
                successful = self.successful_submission_counter(),
                total,
                "submission failed: node returned an error"
            );
            return Err(err.clone());
        }

        let accepted = match resp.get("result") {
            Some(Value::Bool(true)) => true,
            Some(result) if is_truthy(result) => {
                tracing::warn!(
                    algo = self.algo.tag(),
                    successful = self.successful_submission_counter(),
                    total,
                    "submission rejected by node"
                );
                return Err(json!({ "code": 26, "message": "node rejected share" }));
            }
            _ => false,
        };

        if accepted {
            self.successful_submission_counter.fetch_add(1, Ordering::SeqCst);
            tracing::info!(
                algo = self.algo.tag(),
                successful = self.successful_submission_counter(),
                total,
                "submission accepted"
            );
            Ok(())
        } else {
            tracing::warn!(
                algo = self.algo.tag(),
                successful = self.successful_submission_counter(),
                total,
                "submission failed: unknown error"
            );
            Err(json!({ "code": 25, "message": "unknown error" }))
        }
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_matches_python_semantics() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!("bad-block")));
        assert!(is_truthy(&json!(1)));
    }

    #[tokio::test]
    async fn subscribe_returns_current_job_immediately() {
        let rpc = NodeRpc::new(url::Url::parse("http://127.0.0.1:1").unwrap()).unwrap();
        let bc = BackendClient::new(Algo::RandomX, rpc, false);
        assert!(bc.last_job().await.is_none());

        let (tx, _rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let delivered = bc.subscribe(id, tx).await;
        assert!(delivered.is_none());

        bc.unsubscribe(&id).await;
        let state = bc.state.lock().await;
        assert!(state.subscribers.is_empty());
    }
}
