// ABOUTME: Fake platform API and exec service for integration tests, served with hyper.
// ABOUTME: Registered client keys are authorized on the paired test gateway.

use super::gateway::Gateway;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const EXEC_PATH: &str = "/exec";
pub const ROUTING_USER: &str = "dyno-route-7f3a";

/// How the fake control plane answers.
#[derive(Clone)]
pub struct Scenario {
    /// `None` answers the feature lookup with 404.
    pub feature_enabled: Option<bool>,
    pub exec_url_configured: bool,
    /// Status for key registration; anything but 200 is returned bare.
    pub registration_status: u16,
    /// Put the gateway address in the registration response.
    pub embed_endpoint: bool,
    pub send_fingerprint: bool,
    /// Hand out this fingerprint instead of the gateway's real one.
    pub fingerprint_override: Option<String>,
    /// Override the gateway port handed out (e.g. a closed port).
    pub tunnel_port: Option<u16>,
    pub expires_at: Option<String>,
    /// Register keys on the gateway under this user instead of the routing user.
    pub authorize_as: Option<String>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            feature_enabled: Some(true),
            exec_url_configured: true,
            registration_status: 200,
            embed_endpoint: true,
            send_fingerprint: true,
            fingerprint_override: None,
            tunnel_port: None,
            expires_at: None,
            authorize_as: None,
        }
    }
}

struct State {
    scenario: Scenario,
    gateway: Arc<Gateway>,
    api_url: String,
    requests: Mutex<Vec<String>>,
    keys: Mutex<Vec<String>>,
}

pub struct FakeControlPlane {
    pub addr: SocketAddr,
    state: Arc<State>,
    cancel: CancellationToken,
}

impl FakeControlPlane {
    pub async fn start(scenario: Scenario, gateway: Arc<Gateway>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind control plane");
        let addr = listener.local_addr().expect("control plane addr");
        let state = Arc::new(State {
            scenario,
            gateway,
            api_url: format!("http://{addr}"),
            requests: Mutex::new(Vec::new()),
            keys: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();

        let serve_state = Arc::clone(&state);
        let serve_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = serve_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => continue,
                    },
                };
                let state = Arc::clone(&serve_state);
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&state)));
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            state,
            cancel,
        }
    }

    pub fn api_url(&self) -> String {
        self.state.api_url.clone()
    }

    /// `METHOD /path` of every request received, in order.
    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().clone()
    }

    /// Public keys submitted for registration, in order.
    pub fn registered_keys(&self) -> Vec<String> {
        self.state.keys.lock().clone()
    }
}

impl Drop for FakeControlPlane {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn reply(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
}

fn endpoint_fields(state: &State) -> Value {
    let gateway = &state.gateway;
    let port = state.scenario.tunnel_port.unwrap_or(gateway.addr.port());
    let mut fields = json!({
        "tunnel_host": gateway.addr.ip().to_string(),
        "tunnel_port": port,
        "client_user": ROUTING_USER,
    });
    if state.scenario.send_fingerprint {
        let fingerprint = state
            .scenario
            .fingerprint_override
            .clone()
            .unwrap_or_else(|| gateway.fingerprint.clone());
        fields["host_key_fingerprint"] = json!(fingerprint);
    }
    fields
}

async fn handle(req: Request<Incoming>, state: Arc<State>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    state.requests.lock().push(format!("{method} {path}"));

    let authorized = req.headers().contains_key(hyper::header::AUTHORIZATION);
    if !authorized {
        return Ok(reply(StatusCode::UNAUTHORIZED, json!({"id": "unauthorized"})));
    }

    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let scenario = &state.scenario;

    let response = match (method, segments.as_slice()) {
        (Method::GET, ["apps", _app, "features", _feature]) => match scenario.feature_enabled {
            Some(enabled) => reply(StatusCode::OK, json!({ "enabled": enabled })),
            None => reply(StatusCode::NOT_FOUND, json!({"id": "not_found"})),
        },
        (Method::GET, ["apps", _app, "config-vars"]) => {
            let mut vars = json!({ "DATABASE_URL": "postgres://secret", "PORT": "5000" });
            if scenario.exec_url_configured {
                vars["HEROKU_EXEC_URL"] = json!(format!("{}{}/", state.api_url, EXEC_PATH));
            }
            reply(StatusCode::OK, vars)
        }
        (Method::PUT, ["exec", "api", "v2", _app, _dyno]) => {
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => return Ok(reply(StatusCode::BAD_REQUEST, json!({}))),
            };
            let parsed: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
            let Some(key) = parsed["client_key"].as_str() else {
                return Ok(reply(StatusCode::BAD_REQUEST, json!({"id": "missing_key"})));
            };
            state.keys.lock().push(key.to_string());

            if scenario.registration_status != 200 {
                let status = StatusCode::from_u16(scenario.registration_status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return Ok(reply(status, json!({"id": "denied", "message": "not allowed"})));
            }

            let user = scenario.authorize_as.as_deref().unwrap_or(ROUTING_USER);
            state.gateway.authorize(key, user);

            let mut body = if scenario.embed_endpoint {
                endpoint_fields(&state)
            } else {
                json!({})
            };
            if let Some(expires_at) = &scenario.expires_at {
                body["expires_at"] = json!(expires_at);
            }
            reply(StatusCode::OK, body)
        }
        (Method::GET, ["exec", "api", "v2", _app, _dyno, "tunnel"]) => {
            reply(StatusCode::OK, endpoint_fields(&state))
        }
        _ => reply(StatusCode::NOT_FOUND, json!({"id": "not_found"})),
    };

    Ok(response)
}
