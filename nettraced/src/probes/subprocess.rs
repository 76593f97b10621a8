//! Subprocess Probe: spawns the `retsnoop` helper and parses its
//! line-oriented stdout into events with an explicit state machine value,
//! which is easier to unit-test with line fixtures than a stack of
//! closures mutating shared state.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{EventCallback, Probe, RawProbeEvent, RawTimestamp};
use crate::error::ProbeError;
use crate::ip_matcher::IpMatcher;

const DRAIN_WAIT: Duration = Duration::from_secs(10);
const EXIT_WAIT: Duration = Duration::from_secs(10);
const SKIP_LOG_EVERY: u64 = 256;

static HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<ts>\d{19})\s*->.*?(?P<tid>\d+)/(?P<pid>\d+)\s*\((?P<tname>[^/]+)/(?P<pname>[^)]+)\)").unwrap()
});
static MISSING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x{203c}.*missing").unwrap());
static ENTRY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>[A-Za-z_][A-Za-z0-9_]*)\s*=>(?P<saddr>\d+)-(?P<sport>\d+)-(?P<daddr>\d+)-(?P<dport>\d+)#").unwrap()
});
static EXIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<mark>[\x{2194}\x{2190}])\s*(?P<name>[A-Za-z_][A-Za-z0-9_]*).*~(?P<time>[0-9]*\.[0-9]*)us<=(?P<saddr>\d+)-").unwrap()
});
const TAIL_MARKER: &str = "-END-";

/// One fully-assembled retsnoop trace: a syscall's aggregate per-function
/// time plus the per-subflow breakdown for every traversal of a
/// flow-starting function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetsnoopEvent {
    pub pid: u32,
    pub tid: u32,
    pub pname: String,
    pub tname: String,
    pub functions: HashMap<String, u64>,
    pub flows: Vec<FlowRecord>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowRecord {
    pub saddr: String,
    pub sport: u16,
    pub daddr: String,
    pub dport: u16,
    pub functions: HashMap<String, u64>,
}

impl RetsnoopEvent {
    fn to_json(&self) -> Value {
        json!({
            "pid": self.pid,
            "tid": self.tid,
            "pname": self.pname,
            "tname": self.tname,
            "functions": self.functions,
            "flows": self.flows.iter().map(|f| json!({
                "saddr": f.saddr,
                "sport": f.sport,
                "daddr": f.daddr,
                "dport": f.dport,
                "functions": f.functions,
            })).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Clone)]
struct Assembling {
    ts: u64,
    pid: u32,
    tid: u32,
    pname: String,
    tname: String,
    functions: HashMap<String, u64>,
    flows: Vec<FlowRecord>,
    current_flow: Option<usize>,
    depth: i64,
}

/// Pure transition function over one line of stdout. `flow_starting_fns`
/// names the kernel function(s) whose entry marks a new per-flow sub-event
/// (e.g. `__tcp_transmit_skb`, `mptcp_sendmsg`); `ip_filter` drops flows
/// whose source address matches the configured exclusion list.
#[derive(Debug, Clone)]
pub enum ParserState {
    Idle,
    Assembling(Box<Assembling>),
    Drop { skipped: u64 },
}

impl Default for ParserState {
    fn default() -> Self {
        ParserState::Idle
    }
}

pub struct TransitionOutput {
    pub state: ParserState,
    pub published: Option<RetsnoopEvent>,
}

pub fn transition(state: ParserState, line: &str, flow_starting_fns: &[String], ip_filter: &IpMatcher) -> TransitionOutput {
    match state {
        ParserState::Idle => {
            if let Some(caps) = HEADER_RE.captures(line) {
                ParserState::Idle.start_assembling(&caps)
            } else {
                TransitionOutput {
                    state: ParserState::Idle,
                    published: None,
                }
            }
        }
        ParserState::Assembling(assembling) => handle_assembling(*assembling, line, flow_starting_fns, ip_filter),
        ParserState::Drop { skipped } => {
            if let Some(caps) = HEADER_RE.captures(line) {
                ParserState::Idle.start_assembling(&caps)
            } else {
                let skipped = skipped + 1;
                if skipped % SKIP_LOG_EVERY == 0 {
                    tracing::debug!(skipped, "retsnoop parser: skipped lines while dropping event");
                }
                TransitionOutput {
                    state: ParserState::Drop { skipped },
                    published: None,
                }
            }
        }
    }
}

impl ParserState {
    fn start_assembling(self, caps: &regex::Captures) -> TransitionOutput {
        let assembling = Assembling {
            ts: caps["ts"].parse().unwrap_or(0),
            tid: caps["tid"].parse().unwrap_or(0),
            pid: caps["pid"].parse().unwrap_or(0),
            tname: caps["tname"].to_string(),
            pname: caps["pname"].to_string(),
            functions: HashMap::new(),
            flows: Vec::new(),
            current_flow: None,
            depth: -1,
        };
        TransitionOutput {
            state: ParserState::Assembling(Box::new(assembling)),
            published: None,
        }
    }
}

fn handle_assembling(mut s: Assembling, line: &str, flow_starting_fns: &[String], ip_filter: &IpMatcher) -> TransitionOutput {
    if MISSING_RE.is_match(line) {
        return TransitionOutput {
            state: ParserState::Drop { skipped: 0 },
            published: None,
        };
    }

    if line.trim() == TAIL_MARKER {
        let event = RetsnoopEvent {
            pid: s.pid,
            tid: s.tid,
            pname: s.pname.clone(),
            tname: s.tname.clone(),
            functions: s.functions.clone(),
            flows: s.flows.clone(),
        };
        return TransitionOutput {
            state: ParserState::Idle,
            published: Some(event),
        };
    }

    if let Some(caps) = ENTRY_RE.captures(line) {
        let name = &caps["name"];
        let saddr_int: u32 = caps["saddr"].parse().unwrap_or(0);
        let saddr = std::net::Ipv4Addr::from(saddr_int);
        if ip_filter.matches_v4(saddr.octets()) {
            return TransitionOutput {
                state: ParserState::Drop { skipped: 0 },
                published: None,
            };
        }
        if flow_starting_fns.iter().any(|f| f == name) {
            let sport: u16 = caps["sport"].parse().unwrap_or(0);
            let daddr_int: u32 = caps["daddr"].parse().unwrap_or(0);
            let daddr = std::net::Ipv4Addr::from(daddr_int);
            let dport: u16 = caps["dport"].parse().unwrap_or(0);
            s.flows.push(FlowRecord {
                saddr: saddr.to_string(),
                sport,
                daddr: daddr.to_string(),
                dport,
                functions: HashMap::new(),
            });
            s.current_flow = Some(s.flows.len() - 1);
            s.depth += 1;
        }
        return TransitionOutput {
            state: ParserState::Assembling(Box::new(s)),
            published: None,
        };
    }

    if let Some(caps) = EXIT_RE.captures(line) {
        if s.depth < 0 {
            return TransitionOutput {
                state: ParserState::Drop { skipped: 0 },
                published: None,
            };
        }

        let mark = &caps["mark"];
        let name = caps["name"].to_string();
        let time = caps["time"].parse::<f64>().unwrap_or(0.0).round() as u64;

        *s.functions.entry(name.clone()).or_insert(0) += time;
        if let Some(idx) = s.current_flow {
            *s.flows[idx].functions.entry(name.clone()).or_insert(0) += time;
        }

        if mark == "\u{2190}" && flow_starting_fns.iter().any(|f| f == &name) {
            s.depth -= 1;
        }
        return TransitionOutput {
            state: ParserState::Assembling(Box::new(s)),
            published: None,
        };
    }

    let _ = s.ts;
    TransitionOutput {
        state: ParserState::Assembling(Box::new(s)),
        published: None,
    }
}

#[derive(Debug, Deserialize)]
struct RetsnoopOptions {
    #[serde(default)]
    preset: Option<String>,
    #[serde(default)]
    exclude_ips: Vec<String>,
    #[serde(default = "default_flow_starting_fns")]
    flow_starting_functions: Vec<String>,
    #[serde(default)]
    log_file: Option<String>,
    #[serde(default = "default_binary")]
    binary: String,
}

fn default_flow_starting_fns() -> Vec<String> {
    vec!["__tcp_transmit_skb".to_string(), "mptcp_sendmsg".to_string()]
}

fn default_binary() -> String {
    "retsnoop".to_string()
}

fn argv_for_preset(preset: Option<&str>) -> Vec<String> {
    match preset {
        Some("key_functions_only") => vec!["-e".into(), "tcp:__tcp_transmit_skb".into(), "-e".into(), "tcp:mptcp_sendmsg".into()],
        _ => vec!["-e".into(), "tcp:*".into()],
    }
}

pub struct SubprocessProbe {
    binary: String,
    argv: Vec<String>,
    flow_starting_fns: Vec<String>,
    ip_filter: Arc<IpMatcher>,
    log_file: Option<String>,
    callback: EventCallback,
    running: Arc<AtomicBool>,
    child: Option<Child>,
    stdout_handle: Option<JoinHandle<()>>,
    stderr_handle: Option<JoinHandle<()>>,
}

impl SubprocessProbe {
    fn new(options: RetsnoopOptions, callback: EventCallback) -> Result<Self, ProbeError> {
        let ip_filter = IpMatcher::new(&options.exclude_ips).map_err(ProbeError::InvalidCidr)?;
        Ok(Self {
            binary: options.binary,
            argv: argv_for_preset(options.preset.as_deref()),
            flow_starting_fns: options.flow_starting_functions,
            ip_filter: Arc::new(ip_filter),
            log_file: options.log_file,
            callback,
            running: Arc::new(AtomicBool::new(false)),
            child: None,
            stdout_handle: None,
            stderr_handle: None,
        })
    }
}

impl Probe for SubprocessProbe {
    fn start(&mut self) -> Result<(), ProbeError> {
        if self.child.is_some() {
            return Ok(());
        }

        let mut child = Command::new(&self.binary)
            .args(&self.argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProbeError::StartFailed(format!("failed to spawn '{}': {e}", self.binary)))?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let callback = Arc::clone(&self.callback);
        let flow_starting_fns = self.flow_starting_fns.clone();
        let ip_filter = Arc::clone(&self.ip_filter);
        let log_file_path = self.log_file.clone();

        self.stdout_handle = Some(thread::spawn(move || {
            let mut log_file = log_file_path.and_then(|path| std::fs::File::create(path).ok());
            let mut state = ParserState::Idle;
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(line) = line else { break };
                if let Some(file) = log_file.as_mut() {
                    use std::io::Write;
                    let _ = writeln!(file, "{line}");
                }
                let output = transition(state, &line, &flow_starting_fns, &ip_filter);
                state = output.state;
                if let Some(event) = output.published {
                    callback(RawProbeEvent {
                        timestamp: RawTimestamp::None,
                        payload: event.to_json(),
                    });
                }
            }
        }));

        let running_err = Arc::clone(&self.running);
        self.stderr_handle = Some(thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                if !running_err.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(line) = line else { break };
                tracing::debug!(target: "retsnoop", "{line}");
            }
        }));

        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        self.running.store(false, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel();
        if let Some(handle) = self.stdout_handle.take() {
            let tx = tx.clone();
            thread::spawn(move || {
                let _ = handle.join();
                let _ = tx.send(());
            });
        }
        if let Some(handle) = self.stderr_handle.take() {
            thread::spawn(move || {
                let _ = handle.join();
            });
        }
        let _ = rx.recv_timeout(DRAIN_WAIT);

        let pid = child.id() as i32;
        // SAFETY: `pid` is a valid pid owned by this process until reaped.
        unsafe {
            libc::kill(pid, libc::SIGINT);
        }

        let (exit_tx, exit_rx) = mpsc::channel();
        thread::spawn(move || {
            let status = child.wait();
            let _ = exit_tx.send(status);
        });
        if exit_rx.recv_timeout(EXIT_WAIT).is_err() {
            tracing::warn!("retsnoop did not exit within 10s after SIGINT; sending SIGKILL");
            // SAFETY: `pid` is still valid; the waiter thread above will
            // reap it once the kernel delivers SIGKILL.
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }
}

pub fn factory(callback: EventCallback, options: Value) -> Result<Box<dyn Probe>, ProbeError> {
    let options: RetsnoopOptions = serde_json::from_value(options).map_err(|e| ProbeError::MalformedOptions {
        probe: "retsnoop".to_string(),
        reason: e.to_string(),
    })?;
    Ok(Box::new(SubprocessProbe::new(options, callback)?))
}
