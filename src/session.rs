/// Client Session: per-connection framing, dispatch and job delivery for
/// both dialects.
use crate::backend::BackendClient;
use crate::job::{self, Job};
use crate::protocol::{self, Notification, Request, Response};
use rand::RngCore;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Unbound,
    Progpow,
    RandomX,
}

struct ClientSession {
    id: Uuid,
    peer: SocketAddr,
    progpow: Arc<BackendClient>,
    randomx: Arc<BackendClient>,
    binding: Binding,
}

impl ClientSession {
    /// A request is only honored against the backend it's currently bound
    /// to, or to establish a binding from `Unbound`. A session already bound
    /// to one dialect cannot switch to the other.
    fn backend_for(&self, wanted: Binding) -> Result<&Arc<BackendClient>, Value> {
        match (self.binding, wanted) {
            (Binding::Unbound, Binding::Progpow) | (Binding::Progpow, Binding::Progpow) => {
                Ok(&self.progpow)
            }
            (Binding::Unbound, Binding::RandomX) | (Binding::RandomX, Binding::RandomX) => {
                Ok(&self.randomx)
            }
            _ => Err(json!({
                "code": protocol::ERR_ALREADY_SUBSCRIBED,
                "message": "session already bound to the other dialect"
            })),
        }
    }
}

/// Renders a notification line for `job`, or `None` if the session isn't
/// bound to the dialect the job belongs to.
fn render_notify(binding: Binding, job: &Job) -> Option<String> {
    match (binding, job) {
        (Binding::Progpow, Job::Progpow(j)) => {
            let params = json!([
                j.job_id,
                j.pprpcheader,
                "",
                j.target,
                false,
                j.height,
                j.bits,
                j.pprpcepoch,
                j.pprpcnextepoch,
                j.pprpcnextepochheight,
            ]);
            let note = Notification::new("mining.notify", params);
            serde_json::to_string(&note).ok().map(|mut s| {
                s.push('\n');
                s
            })
        }
        (Binding::RandomX, Job::RandomX(j)) => {
            render_randomx_job(j).map(|job_obj| {
                let note = Notification::new("job", job_obj);
                let mut s = serde_json::to_string(&note).unwrap();
                s.push('\n');
                s
            })
        }
        _ => None,
    }
}

/// Builds the XMRig-style job object: a fresh random nonce window spliced
/// into the header, and target/seed_hash reversed to little-endian for the
/// miner, matching the original's per-delivery blob substitution.
fn render_randomx_job(j: &job::RandomXJob) -> Option<Value> {
    let header = splice_nonce_window(&j.rxrpcheader)?;
    let seed_hash = job::reverse_endianness(&j.rxrpcseed).ok()?;
    let target_prefix = j.target.get(..16)?;
    let target = job::reverse_endianness(target_prefix).ok()?;
    Some(json!({
        "job_id": j.job_id,
        "blob": header,
        "target": target,
        "seed_hash": seed_hash,
        "height": j.height,
        "algo": "rx/veil",
    }))
}

/// Replaces the 8 hex characters at offset 280 (the nonce field) with fresh
/// random bytes so two deliveries of the same template never collide.
fn splice_nonce_window(header: &str) -> Option<String> {
    if header.len() < 288 {
        return None;
    }
    let mut nonce_bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce_hex = hex::encode(nonce_bytes);
    Some(format!(
        "{}{}{}",
        &header[..280],
        nonce_hex,
        &header[288..]
    ))
}

/// Drives one accepted connection until EOF, a fatal I/O error, or
/// cancellation. Never closes the socket merely because of a protocol-level
/// error — only transport failure or shutdown end the session.
pub async fn run_session(
    socket: TcpStream,
    peer: SocketAddr,
    progpow: Arc<BackendClient>,
    randomx: Arc<BackendClient>,
    cancel: CancellationToken,
) {
    let id = Uuid::new_v4();
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Arc<Job>>();
    let mut session = ClientSession {
        id,
        peer,
        progpow: progpow.clone(),
        randomx: randomx.clone(),
        binding: Binding::Unbound,
    };

    let mut line = String::new();
    loop {
        line.clear();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = job_rx.recv() => {
                let Some(job) = job else { continue };
                if let Some(text) = render_notify(session.binding, &job) {
                    let _ = out_tx.send(text);
                }
            }
            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => break,
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "read error, closing session");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        handle_line(&mut session, trimmed, &job_tx, &out_tx).await;
                    }
                }
            }
        }
    }

    match session.binding {
        Binding::Progpow => progpow.unsubscribe(&id).await,
        Binding::RandomX => randomx.unsubscribe(&id).await,
        Binding::Unbound => {}
    }
    drop(out_tx);
    let _ = writer_task.await;
    tracing::debug!(peer = %peer, "session closed");
}

/// Parses and dispatches one line. Silently drops malformed JSON and a
/// structurally valid object missing `method`/`params`, matching the
/// source's dispatch gate — no response is produced in either case.
async fn handle_line(
    session: &mut ClientSession,
    line: &str,
    job_tx: &mpsc::UnboundedSender<Arc<Job>>,
    out_tx: &mpsc::UnboundedSender<String>,
) {
    let Ok(parsed) = serde_json::from_str::<Value>(line) else {
        return;
    };
    let Ok(req) = serde_json::from_value::<Request>(parsed) else {
        return;
    };
    if !protocol::is_dispatchable(&req) {
        return;
    }

    let id = req.id.clone().unwrap_or(Value::Null);
    let method = req.method.clone().unwrap();
    let params = req.params.clone().unwrap();

    dispatch(session, id, &method, params, job_tx, out_tx).await;
}

fn send_response(out_tx: &mpsc::UnboundedSender<String>, response: Response) {
    if let Ok(mut s) = serde_json::to_string(&response) {
        s.push('\n');
        let _ = out_tx.send(s);
    }
}

/// Every method is answered through `out_tx` rather than a return value, so
/// that `mining.submit`/`submit` can hand their node round-trip off to a
/// detached task without blocking this session's read/dispatch loop (§5).
async fn dispatch(
    session: &mut ClientSession,
    id: Value,
    method: &str,
    params: Value,
    job_tx: &mpsc::UnboundedSender<Arc<Job>>,
    out_tx: &mpsc::UnboundedSender<String>,
) {
    match method {
        "mining.subscribe" => send_response(out_tx, subscribe_progpow(session, id, job_tx).await),
        "mining.authorize" | "mining.extranonce.subscribe" => {
            let resp = match session.backend_for(Binding::Progpow) {
                Ok(_) => {
                    session.binding = Binding::Progpow;
                    Response::ok(id, json!(true))
                }
                Err(e) => Response::err_value(id, e),
            };
            send_response(out_tx, resp);
        }
        "mining.submit" => spawn_submit_progpow(session, id, params, out_tx.clone()),
        "login" => send_response(out_tx, login_randomx(session, id, params, job_tx).await),
        "submit" => spawn_submit_randomx(session, id, params, out_tx.clone()),
        _ => send_response(out_tx, Response::err(id, protocol::ERR_UNSUPPORTED_METHOD, "unsupported method")),
    }
}

async fn subscribe_progpow(
    session: &mut ClientSession,
    id: Value,
    job_tx: &mpsc::UnboundedSender<Arc<Job>>,
) -> Response {
    let backend = match session.backend_for(Binding::Progpow) {
        Ok(b) => b.clone(),
        Err(e) => return Response::err_value(id, e),
    };
    session.binding = Binding::Progpow;
    let current = backend.subscribe(session.id, job_tx.clone()).await;
    if let Some(job) = current {
        let _ = job_tx.send(job);
    }
    Response::ok(id, json!(true))
}

async fn login_randomx(
    session: &mut ClientSession,
    id: Value,
    params: Value,
    job_tx: &mpsc::UnboundedSender<Arc<Job>>,
) -> Response {
    let backend = match session.backend_for(Binding::RandomX) {
        Ok(b) => b.clone(),
        Err(e) => return Response::err_value(id, e),
    };
    if params.get("login").and_then(|v| v.as_str()).is_none() {
        return Response::err(id, protocol::ERR_BAD_PARAMS, "missing login");
    }
    session.binding = Binding::RandomX;
    let current = backend.subscribe(session.id, job_tx.clone()).await;
    let job_obj = current.as_deref().and_then(|j| match j {
        Job::RandomX(rxj) => render_randomx_job(rxj),
        _ => None,
    });

    Response::ok(
        id,
        json!({
            "id": "rig",
            "job": job_obj,
            "status": "OK",
            "extensions": ["algo"],
        }),
    )
}

/// Validates `mining.submit`'s params synchronously (cheap, no I/O), then
/// hands the node round-trip to a detached task so a slow node response
/// can't stall this session's read loop or job delivery.
fn spawn_submit_progpow(
    session: &ClientSession,
    id: Value,
    params: Value,
    out_tx: mpsc::UnboundedSender<String>,
) {
    let backend = match session.backend_for(Binding::Progpow) {
        Ok(b) => b.clone(),
        Err(e) => {
            send_response(&out_tx, Response::err_value(id, e));
            return;
        }
    };

    let arr = match params.as_array() {
        Some(a) => a,
        None => {
            send_response(
                &out_tx,
                Response::err(id, protocol::ERR_BAD_PARAMS, "Bad request: expected 5 parameters but got 0."),
            );
            return;
        }
    };
    if arr.len() != 5 {
        send_response(
            &out_tx,
            Response::err(
                id,
                protocol::ERR_BAD_PARAMS,
                format!("Bad request: expected 5 parameters but got {}.", arr.len()),
            ),
        );
        return;
    }

    let fields = (
        arr[1].as_str().map(str::to_string),
        arr[2].as_str().map(str::to_string),
        arr[3].as_str().map(str::to_string),
        arr[4].as_str().map(str::to_string),
    );
    let (job_id, nonce, header_hash, mix_hash) = match fields {
        (Some(j), Some(n), Some(h), Some(m)) => (j, n, h, m),
        _ => {
            send_response(
                &out_tx,
                Response::err(id, protocol::ERR_BAD_PARAMS, "job_id, nonce, header_hash and mix_hash must be strings"),
            );
            return;
        }
    };

    tokio::spawn(async move {
        let current = backend.last_job().await;
        let is_current = current
            .as_deref()
            .map(|j| j.job_id() == job_id)
            .unwrap_or(false);
        if !is_current {
            send_response(&out_tx, Response::err(id, protocol::ERR_STALE_SHARE, "Stale share."));
            return;
        }

        let submit_params = json!([
            job::strip_0x(&header_hash),
            job::strip_0x(&mix_hash),
            job::strip_0x(&nonce),
        ]);
        let resp = match backend.submit("pprpcsb", submit_params).await {
            Ok(()) => Response::ok(id, json!(true)),
            Err(e) => Response::err_value(id, e),
        };
        send_response(&out_tx, resp);
    });
}

/// Same detaching strategy as [`spawn_submit_progpow`] for the R dialect's
/// `submit`. The nonce is forwarded byte-reversed (`reverseEndianess`) and
/// the node call carries the job's own header rather than the client's
/// `job_id`, matching `rxrpcsb(header, rx_hash, nonce)`.
fn spawn_submit_randomx(
    session: &ClientSession,
    id: Value,
    params: Value,
    out_tx: mpsc::UnboundedSender<String>,
) {
    let backend = match session.backend_for(Binding::RandomX) {
        Ok(b) => b.clone(),
        Err(e) => {
            send_response(&out_tx, Response::err_value(id, e));
            return;
        }
    };

    let fields = (
        params.get("job_id").and_then(|v| v.as_str()).map(str::to_string),
        params.get("nonce").and_then(|v| v.as_str()).map(str::to_string),
        params.get("result").and_then(|v| v.as_str()).map(str::to_string),
    );
    let (job_id, nonce, rx_hash) = match fields {
        (Some(j), Some(n), Some(r)) => (j, n, r),
        _ => {
            send_response(
                &out_tx,
                Response::err(id, protocol::ERR_BAD_PARAMS, "missing job_id, nonce or result"),
            );
            return;
        }
    };

    tokio::spawn(async move {
        let current = backend.last_job().await;
        let header = match current.as_deref() {
            Some(Job::RandomX(rxj)) if rxj.job_id == job_id => rxj.rxrpcheader.clone(),
            _ => {
                send_response(&out_tx, Response::err(id, protocol::ERR_STALE_SHARE, "Stale share."));
                return;
            }
        };

        let reversed_nonce = match job::reverse_endianness(&nonce) {
            Ok(n) => n,
            Err(_) => {
                send_response(&out_tx, Response::err(id, protocol::ERR_BAD_PARAMS, "nonce is not valid hex"));
                return;
            }
        };

        let submit_params = json!([header, rx_hash, reversed_nonce]);
        let resp = match backend.submit("rxrpcsb", submit_params).await {
            Ok(()) => Response::ok(id, json!({ "status": "OK" })),
            Err(e) => Response::err_value(id, e),
        };
        send_response(&out_tx, resp);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progpow_notify_has_ten_params_with_fixed_slots() {
        let job = Job::Progpow(job::ProgpowJob {
            job_id: "h".into(),
            pprpcheader: "h".into(),
            target: "t".into(),
            height: 7,
            bits: "b".into(),
            longpollid: "l".into(),
            pprpcepoch: "e".into(),
            pprpcnextepoch: "ne".into(),
            pprpcnextepochheight: 8,
        });
        let line = render_notify(Binding::Progpow, &job).unwrap();
        let parsed: Value = serde_json::from_str(line.trim()).unwrap();
        let params = parsed["params"].as_array().unwrap();
        assert_eq!(
            params,
            &vec![
                json!("h"),
                json!("h"),
                json!(""),
                json!("t"),
                json!(false),
                json!(7),
                json!("b"),
                json!("e"),
                json!("ne"),
                json!(8),
            ]
        );
    }

    #[test]
    fn unbound_session_ignores_randomx_job() {
        let job = Job::RandomX(job::RandomXJob {
            job_id: "a".into(),
            rxrpcheader: "b".repeat(300),
            rxrpcseed: "cc".into(),
            target: "0011223344556677".into(),
            height: 1,
            longpollid: "l".into(),
        });
        assert!(render_notify(Binding::Unbound, &job).is_none());
        assert!(render_notify(Binding::Progpow, &job).is_none());
    }

    #[test]
    fn splice_nonce_window_replaces_expected_slice() {
        let header = "a".repeat(300);
        let spliced = splice_nonce_window(&header).unwrap();
        assert_eq!(spliced.len(), header.len());
        assert_ne!(&spliced[280..288], &header[280..288]);
        assert_eq!(&spliced[..280], &header[..280]);
        assert_eq!(&spliced[288..], &header[288..]);
    }

    #[test]
    fn splice_nonce_window_rejects_short_header() {
        assert!(splice_nonce_window("abcd").is_none());
    }

    #[test]
    fn randomx_job_rendering_uses_veil_algo_literal() {
        let j = job::RandomXJob {
            job_id: "a".into(),
            rxrpcheader: "b".repeat(300),
            rxrpcseed: "cc".into(),
            target: "0011223344556677".into(),
            height: 1,
            longpollid: "l".into(),
        };
        let rendered = render_randomx_job(&j).unwrap();
        assert_eq!(rendered["algo"], json!("rx/veil"));
    }

    fn test_session(binding: Binding) -> ClientSession {
        let progpow_rpc =
            crate::rpc::NodeRpc::new(url::Url::parse("http://127.0.0.1:1").unwrap()).unwrap();
        let randomx_rpc =
            crate::rpc::NodeRpc::new(url::Url::parse("http://127.0.0.1:1").unwrap()).unwrap();
        ClientSession {
            id: Uuid::new_v4(),
            peer: "127.0.0.1:1".parse().unwrap(),
            progpow: BackendClient::new(job::Algo::Progpow, progpow_rpc, false),
            randomx: BackendClient::new(job::Algo::RandomX, randomx_rpc, false),
            binding,
        }
    }

    #[tokio::test]
    async fn login_randomx_response_uses_rig_id_and_algo_extension() {
        let mut session = test_session(Binding::Unbound);
        let (job_tx, _job_rx) = mpsc::unbounded_channel();
        let resp = login_randomx(&mut session, json!(1), json!({ "login": "wallet" }), &job_tx).await;
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["result"]["id"], json!("rig"));
        assert_eq!(value["result"]["status"], json!("OK"));
        assert_eq!(value["result"]["extensions"], json!(["algo"]));
        assert_eq!(session.binding, Binding::RandomX);
    }

    #[tokio::test]
    async fn login_randomx_rejects_missing_login_field() {
        let mut session = test_session(Binding::Unbound);
        let (job_tx, _job_rx) = mpsc::unbounded_channel();
        let resp = login_randomx(&mut session, json!(1), json!({}), &job_tx).await;
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["error"]["code"], json!(protocol::ERR_BAD_PARAMS));
        assert_eq!(session.binding, Binding::Unbound);
    }

    #[tokio::test]
    async fn progpow_submit_rejects_wrong_arity() {
        let session = test_session(Binding::Progpow);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        spawn_submit_progpow(&session, json!(1), json!(["worker", "job"]), out_tx);
        let line = out_rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["error"]["code"], json!(protocol::ERR_BAD_PARAMS));
        assert_eq!(value["result"], json!(false));
        assert!(value["error"]["message"]
            .as_str()
            .unwrap()
            .contains("expected 5 parameters but got 2"));
    }

    #[tokio::test]
    async fn progpow_submit_rejects_stale_job() {
        let session = test_session(Binding::Progpow);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        spawn_submit_progpow(
            &session,
            json!(1),
            json!(["worker", "job1", "nonce", "aabb", "ccdd"]),
            out_tx,
        );
        let line = out_rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["error"]["code"], json!(protocol::ERR_STALE_SHARE));
        assert_eq!(value["error"]["message"], json!("Stale share."));
    }

    #[tokio::test]
    async fn randomx_submit_rejects_stale_job() {
        let session = test_session(Binding::RandomX);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        spawn_submit_randomx(
            &session,
            json!(1),
            json!({ "job_id": "job1", "nonce": "aabbccdd", "result": "deadbeef" }),
            out_tx,
        );
        let line = out_rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["error"]["code"], json!(protocol::ERR_STALE_SHARE));
        assert_eq!(value["error"]["message"], json!("Stale share."));
    }
}
