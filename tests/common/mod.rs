#![allow(dead_code)]

//! Shared test harness: a stub Consul agent on a loopback listener plus
//! config and script fixtures.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::{Value, json};

use apollo::config::{Config, load_config};

/// One request the stub agent saw.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: String,
}

impl Recorded {
    /// The decoded `note` query parameter, when present.
    pub fn note(&self) -> Option<String> {
        self.query
            .split('&')
            .find_map(|pair| pair.strip_prefix("note="))
            .map(url_decode)
    }
}

#[derive(Debug, Default)]
struct StubState {
    node_checks: String,
    service_health: HashMap<String, String>,
    agent_checks: String,
}

/// Minimal Consul agent: canned JSON per endpoint, every request recorded.
pub struct StubConsul {
    pub endpoint: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
    state: Arc<Mutex<StubState>>,
}

impl StubConsul {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub consul");
        let addr = listener.local_addr().expect("stub consul addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = Arc::new(Mutex::new(StubState {
            node_checks: "[]".to_string(),
            service_health: HashMap::new(),
            agent_checks: "{}".to_string(),
        }));

        let thread_requests = Arc::clone(&requests);
        let thread_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                handle_connection(stream, &thread_requests, &thread_state);
            }
        });

        Self {
            endpoint: format!("http://{addr}"),
            requests,
            state,
        }
    }

    /// Sets the checks returned for `/v1/health/node/<host>`.
    pub fn set_node_checks(&self, checks: Vec<Value>) {
        self.state.lock().unwrap().node_checks = Value::Array(checks).to_string();
    }

    /// Sets the members returned for `/v1/health/service/<service>`.
    pub fn set_service_health(&self, service: &str, members: Vec<Value>) {
        self.state
            .lock()
            .unwrap()
            .service_health
            .insert(service.to_string(), Value::Array(members).to_string());
    }

    /// Sets the map returned for `/v1/agent/checks`.
    pub fn set_agent_checks(&self, checks: &[(&str, &str)]) {
        let map: serde_json::Map<String, Value> = checks
            .iter()
            .map(|(id, status)| (id.to_string(), json!({ "Status": status })))
            .collect();
        self.state.lock().unwrap().agent_checks = Value::Object(map).to_string();
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    /// TTL updates seen so far, as (path, decoded note) pairs.
    pub fn pushes(&self) -> Vec<(String, String)> {
        self.requests()
            .into_iter()
            .filter(|request| request.path.starts_with("/v1/agent/check/"))
            .map(|request| {
                let note = request.note().unwrap_or_default();
                (request.path, note)
            })
            .collect()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }
}

fn handle_connection(
    stream: TcpStream,
    requests: &Arc<Mutex<Vec<Recorded>>>,
    state: &Arc<Mutex<StubState>>,
) {
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(clone) => clone,
        Err(_) => return,
    });
    let mut stream = stream;

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return;
    };
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).is_err() || header.trim().is_empty() {
            break;
        }
        if let Some(value) = header
            .to_ascii_lowercase()
            .strip_prefix("content-length:")
            .map(str::trim)
        {
            content_length = value.parse().unwrap_or(0);
        }
    }
    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        let _ = reader.read_exact(&mut body);
    }

    requests.lock().unwrap().push(Recorded {
        method: method.to_string(),
        path: path.to_string(),
        query: query.to_string(),
    });

    let body = {
        let state = state.lock().unwrap();
        if path.starts_with("/v1/health/node/") {
            state.node_checks.clone()
        } else if let Some(service) = path.strip_prefix("/v1/health/service/") {
            state
                .service_health
                .get(service)
                .cloned()
                .unwrap_or_else(|| "[]".to_string())
        } else if path == "/v1/agent/checks" {
            state.agent_checks.clone()
        } else {
            String::new()
        }
    };

    let _ = write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
}

/// Decodes a percent-encoded query value ('+' means space).
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A node check entry as `/v1/health/node/<host>` returns it.
pub fn node_check(service_id: &str, status: &str, output: &str) -> Value {
    json!({
        "Node": "localhost",
        "CheckID": format!("service:{service_id}"),
        "Name": format!("Service '{service_id}' check"),
        "Status": status,
        "Output": output,
        "ServiceID": service_id,
    })
}

/// A member entry as `/v1/health/service/<service>` returns it.
pub fn member(host: &str, service: &str, status: &str) -> Value {
    json!({
        "Node": { "Node": host },
        "Checks": [
            { "CheckID": "serfHealth", "Status": "passing", "Output": "", "ServiceID": "" },
            {
                "CheckID": format!("service:{service}"),
                "Status": status,
                "Output": "",
                "ServiceID": service,
            },
        ],
    })
}

/// Writes YAML to the temp dir and loads it through the real config path.
pub fn config_from_yaml(dir: &Path, yaml: &str) -> Config {
    let path = dir.join("config.yaml");
    fs::write(&path, yaml).expect("write config");
    load_config(path.to_str().unwrap()).expect("load config")
}

/// The main service's check spec.
pub fn main_spec(config: &Config) -> apollo::config::CheckSpec {
    config
        .check_specs()
        .into_iter()
        .find(|spec| config.is_main_check(spec))
        .expect("config has a main check")
}

/// A sub-service's check spec by human name.
pub fn sub_spec(config: &Config, name: &str) -> apollo::config::CheckSpec {
    config
        .check_specs()
        .into_iter()
        .find(|spec| spec.id == name)
        .expect("config has the sub check")
}

/// Writes an executable shell script and returns its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("write script");
    let mut perms = fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod script");
    path
}
