use std::collections::HashSet;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;

use log::debug;

use crate::error::Result;
use crate::tor::{Response, Tor};
use crate::utils::split_quoted;

use super::ctrl::ClientWriter;
use super::socks::IsolationTag;

const SOCKS_PASSWORD_PREFIX: &str = "SOCKS_PASSWORD=\"";

/// Aggregates the daemon's stream events into a per-launch view of the
/// browser's own circuits, and pushes matching events to registered control
/// clients.
pub struct CircuitMonitor {
    tor: Arc<Tor>,
    tag: Arc<IsolationTag>,
    state: Mutex<MonitorState>,
}

#[derive(Default)]
struct MonitorState {
    circuits: Vec<String>,
    clients: Vec<(u64, Arc<ClientWriter>)>,
}

impl CircuitMonitor {
    /// Subscribes to stream events upstream and starts the event pump.
    pub fn init(
        tor: Arc<Tor>,
        tag: Arc<IsolationTag>,
        events: Receiver<Response>,
    ) -> Result<Arc<Self>> {
        tor.subscribe_stream_events()?;

        let monitor = Arc::new(CircuitMonitor {
            tor,
            tag,
            state: Mutex::new(MonitorState::default()),
        });

        let pump = monitor.clone();
        thread::spawn(move || pump.handle_events(events));
        Ok(monitor)
    }

    pub fn register(&self, id: u64, writer: Arc<ClientWriter>) {
        let mut state = self.state.lock().unwrap();
        if !state.clients.iter().any(|(cid, _)| *cid == id) {
            state.clients.push((id, writer));
        }
    }

    pub fn deregister(&self, id: u64) {
        self.state
            .lock()
            .unwrap()
            .clients
            .retain(|(cid, _)| *cid != id);
    }

    /// The cached, tag-filtered circuit lines.
    pub fn circuit_status(&self) -> Vec<String> {
        self.state.lock().unwrap().circuits.clone()
    }

    fn handle_events(self: Arc<Self>, events: Receiver<Response>) {
        for ev in events {
            if ev.raw_lines.len() > 1 {
                continue;
            }
            let fields = split_quoted(&ev.reply);
            if fields.first().map(String::as_str) != Some("STREAM") || fields.len() < 4 {
                continue;
            }
            // Isolation settings are not pinned until the stream attaches,
            // so of the stream lifecycle only SENTCONNECT is worth a
            // circuit-status refresh.
            if fields[2] != "SENTCONNECT" {
                continue;
            }
            let Ok(circuit_id) = fields[3].parse::<u64>() else {
                continue;
            };

            match self.update_circuit_status(circuit_id) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    debug!("circuits: status refresh failed: {e}");
                    continue;
                }
            }

            let line = format!("{}\r\n", ev.raw_lines[0]);
            let state = self.state.lock().unwrap();
            for (_, client) in &state.clients {
                let _ = client.write(line.as_bytes());
            }
        }
    }

    /// Refreshes the cached view from `GETINFO circuit-status`, keeping only
    /// circuits isolated with the current tag.  Returns whether
    /// `wanted_id` is one of ours.
    fn update_circuit_status(&self, wanted_id: u64) -> Result<bool> {
        let resp = self.tor.getinfo("circuit-status")?;
        if resp.data.is_empty() {
            // No circuits at all.
            return Ok(false);
        }

        let (circuits, ids) = filter_circuits(&resp.raw_lines, &self.tag.suffix());

        let found = ids.contains(&wanted_id);
        self.state.lock().unwrap().circuits = circuits;
        Ok(found)
    }
}

/// Retains the circuit lines whose isolation password ends in
/// `tag_suffix`, with the suffix stripped from the relayed text.
fn filter_circuits(lines: &[String], tag_suffix: &str) -> (Vec<String>, HashSet<u64>) {
    let quoted_suffix = format!("{tag_suffix}\"");

    let mut circuits = Vec::new();
    let mut ids = HashSet::new();

    for line in lines {
        // Skip the framing around the actual status lines.
        if line == "." || line.starts_with("250") {
            continue;
        }

        let mut fields = split_quoted(line);
        let Some(id) = fields.first().and_then(|f| f.parse::<u64>().ok()) else {
            continue;
        };

        let mut ours = false;
        for field in fields.iter_mut().skip(1) {
            if field.starts_with(SOCKS_PASSWORD_PREFIX) && field.ends_with(&quoted_suffix) {
                field.truncate(field.len() - quoted_suffix.len());
                field.push('"');
                ours = true;
                break;
            }
        }
        if ours {
            circuits.push(fields.join(" "));
            ids.insert(id);
        }
    }
    (circuits, ids)
}
