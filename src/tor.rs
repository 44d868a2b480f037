//! Interface to the anonymity daemon: a line-oriented control-port client
//! with an event demultiplexer, bootstrap supervision, and ownership of the
//! surrogate proxies the browser is pointed at.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::net::Endpoint;
use crate::sandbox::Process;
use crate::surrogate::ctrl::CtrlSurrogate;
use crate::surrogate::socks::{IsolationTag, PassthroughProxy, SocksSurrogate};
use crate::task::Task;
use crate::utils::split_quoted;

const CONTROL_PORT_TIMEOUT_SECS: u64 = 10;
const BOOTSTRAP_TIMEOUT_SECS: u64 = 300;
const HALT_GRACE_SECS: u64 = 5;

/// The address the passthrough listener offers to non-browser tools.
const PASSTHROUGH_ADDR: &str = "127.0.0.1:9150";

fn not_running() -> Error {
    Error::Upstream(io::Error::new(io::ErrorKind::NotConnected, "tor is not running"))
}

/// A parsed control-port response (or asynchronous event).
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code of the final line.
    pub status: u16,
    /// Text of the final line, code stripped.
    pub reply: String,
    /// Every line, verbatim, including codes and data-block terminators.
    pub raw_lines: Vec<String>,
    /// Payload lines of `+` data blocks.
    pub data: Vec<String>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == 250
    }

    /// The value of a single-value GETINFO response for `key`.
    pub fn getinfo_value(&self, key: &str) -> Option<&str> {
        let prefix = format!("250-{key}=");
        self.raw_lines
            .iter()
            .find_map(|l| l.strip_prefix(&prefix))
            .or_else(|| {
                // Short final-line form.
                let prefix = format!("250 {key}=");
                self.raw_lines.iter().find_map(|l| l.strip_prefix(&prefix))
            })
    }
}

fn read_response(reader: &mut impl BufRead) -> Result<Response> {
    let mut raw_lines = Vec::new();
    let mut data = Vec::new();

    loop {
        let line = read_line(reader)?;
        if line.len() < 4 {
            return Err(Error::Protocol(format!("short control line: {line:?}")));
        }
        let status: u16 = line[..3]
            .parse()
            .map_err(|_| Error::Protocol(format!("bad status code: {line:?}")))?;
        let sep = line.as_bytes()[3];
        let text = line[4..].to_string();
        raw_lines.push(line.clone());

        match sep {
            b' ' => {
                return Ok(Response {
                    status,
                    reply: text,
                    raw_lines,
                    data,
                });
            }
            b'-' => {}
            b'+' => loop {
                let dline = read_line(reader)?;
                raw_lines.push(dline.clone());
                if dline == "." {
                    break;
                }
                data.push(dline);
            },
            _ => {
                return Err(Error::Protocol(format!("bad line separator: {line:?}")));
            }
        }
    }
}

fn read_line(reader: &mut impl BufRead) -> Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(Error::Upstream(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "control connection closed",
        )));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

struct CtrlInner {
    stream: crate::net::Stream,
    replies: Receiver<Response>,
}

/// The single upstream control connection.  Requests are serialized: at most
/// one in flight, with replies matched by arrival order.  A reader thread
/// peels `650` events off onto their own channel.
pub struct CtrlConn {
    inner: Mutex<CtrlInner>,
}

impl CtrlConn {
    /// Dials the control endpoint, returning the connection and the stream
    /// of asynchronous events.
    pub fn connect(endpoint: &Endpoint) -> Result<(Arc<CtrlConn>, Receiver<Response>)> {
        let stream = endpoint.connect()?;
        let reader_stream = stream.try_clone()?;

        let (reply_tx, reply_rx) = channel();
        let (event_tx, event_rx) = channel();

        thread::spawn(move || {
            let mut reader = BufReader::new(reader_stream);
            loop {
                match read_response(&mut reader) {
                    Ok(resp) if resp.status == 650 => {
                        // Nobody listening just means the circuit display is
                        // off; keep draining.
                        let _ = event_tx.send(resp);
                    }
                    Ok(resp) => {
                        if reply_tx.send(resp).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("tor: control reader exiting: {e}");
                        break;
                    }
                }
            }
        });

        let conn = Arc::new(CtrlConn {
            inner: Mutex::new(CtrlInner {
                stream,
                replies: reply_rx,
            }),
        });
        Ok((conn, event_rx))
    }

    /// Sends one command and waits for its complete reply.
    pub fn request(&self, cmd: &str) -> Result<Response> {
        let mut inner = self.inner.lock().unwrap();
        inner.stream.write_all(cmd.as_bytes())?;
        inner.stream.write_all(b"\r\n")?;
        inner.stream.flush()?;
        inner.replies.recv().map_err(|_| not_running())
    }

    /// Authenticates with the given credential (a quoted password or a hex
    /// cookie), or with no credential at all.
    pub fn authenticate(&self, credential: Option<&str>) -> Result<()> {
        let cmd = match credential {
            Some(c) => format!("AUTHENTICATE {c}"),
            None => "AUTHENTICATE".to_string(),
        };
        let resp = self.request(&cmd)?;
        if !resp.is_ok() {
            return Err(Error::Config(format!(
                "control port authentication failed: {}",
                resp.reply
            )));
        }
        Ok(())
    }
}

struct Surrogates {
    ctrl: Arc<CtrlSurrogate>,
    socks: Arc<SocksSurrogate>,
    passthrough: Option<Arc<PassthroughProxy>>,
}

struct TorState {
    bootstrapped: bool,
    ctrl: Option<Arc<CtrlConn>>,
    events: Option<Receiver<Response>>,
    process: Option<Process>,
    socks: Option<Endpoint>,
    surrogates: Option<Surrogates>,
    unlink_on_exit: Vec<PathBuf>,
}

/// A tor instance: either a host service we merely talk to, or a daemon we
/// launched inside its own sandbox.
pub struct Tor {
    is_system: bool,
    ctrl_endpoint: Endpoint,
    data_dir: Option<PathBuf>,
    state: Mutex<TorState>,
}

impl Tor {
    /// Wraps a host tor service.  The control connection is established and
    /// authenticated immediately.
    pub fn system(ctrl_endpoint: Endpoint) -> Result<Arc<Tor>> {
        let (ctrl, events) = CtrlConn::connect(&ctrl_endpoint)?;
        ctrl.authenticate(None)?;

        Ok(Arc::new(Tor {
            is_system: true,
            ctrl_endpoint,
            data_dir: None,
            state: Mutex::new(TorState {
                bootstrapped: true,
                ctrl: Some(ctrl),
                events: Some(events),
                process: None,
                socks: None,
                surrogates: None,
                unlink_on_exit: Vec::new(),
            }),
        }))
    }

    /// Wraps a daemon we launched, before it has bootstrapped.  `data_dir`
    /// is the host-side view of the daemon's data directory, where its
    /// sockets and the control-port marker appear.
    pub fn sandboxed(process: Process, data_dir: &Path) -> Arc<Tor> {
        let socks_path = data_dir.join("socks");
        let ctrl_path = data_dir.join("control");

        Arc::new(Tor {
            is_system: false,
            ctrl_endpoint: Endpoint::Unix(ctrl_path.clone()),
            data_dir: Some(data_dir.to_path_buf()),
            state: Mutex::new(TorState {
                bootstrapped: false,
                ctrl: None,
                events: None,
                process: Some(process),
                socks: Some(Endpoint::Unix(socks_path.clone())),
                surrogates: None,
                unlink_on_exit: vec![socks_path, ctrl_path],
            }),
        })
    }

    fn ctrl(&self) -> Result<Arc<CtrlConn>> {
        self.state.lock().unwrap().ctrl.clone().ok_or_else(not_running)
    }

    /// Hands the asynchronous event stream to its one consumer, the circuit
    /// monitor.
    pub(crate) fn take_events(&self) -> Option<Receiver<Response>> {
        self.state.lock().unwrap().events.take()
    }

    pub fn getinfo(&self, arg: &str) -> Result<Response> {
        self.ctrl()?.request(&format!("GETINFO {arg}"))
    }

    pub fn getconf(&self, arg: &str) -> Result<Response> {
        self.ctrl()?.request(&format!("GETCONF {arg}"))
    }

    /// Registers for STREAM events on the upstream connection.
    pub fn subscribe_stream_events(&self) -> Result<()> {
        let resp = self.ctrl()?.request("SETEVENTS STREAM")?;
        if !resp.is_ok() {
            return Err(Error::Protocol(format!(
                "failed to register for stream events: {}",
                resp.reply
            )));
        }
        Ok(())
    }

    pub fn newnym(&self) -> Result<()> {
        let resp = self.ctrl()?.request("SIGNAL NEWNYM")?;
        if !resp.is_ok() {
            return Err(Error::Protocol(format!("NEWNYM refused: {}", resp.reply)));
        }
        Ok(())
    }

    /// The daemon's version string, learned once at launch.
    pub fn version(&self) -> Result<String> {
        let resp = self.getinfo("version")?;
        resp.getinfo_value("version")
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol(format!("unparseable version reply: {:?}", resp.raw_lines)))
    }

    /// The daemon's real SOCKS endpoint.
    pub fn socks_endpoint(&self) -> Result<Endpoint> {
        if let Some(ep) = self.state.lock().unwrap().socks.clone() {
            return Ok(ep);
        }

        let resp = self.getinfo("net/listeners/socks")?;
        let listing = resp
            .getinfo_value("net/listeners/socks")
            .ok_or_else(|| Error::Protocol("no SOCKS listeners reported".into()))?;
        let first = split_quoted(listing)
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol("empty SOCKS listener list".into()))?;
        let first = first.trim_matches('"');

        let ep = if let Some(path) = first.strip_prefix("unix:") {
            Endpoint::Unix(PathBuf::from(path))
        } else {
            Endpoint::Tcp(
                first
                    .parse()
                    .map_err(|_| Error::Protocol(format!("bad SOCKS listener: {first}")))?,
            )
        };

        self.state.lock().unwrap().socks = Some(ep.clone());
        Ok(ep)
    }

    /// Bootstraps a launcher-managed daemon: waits for the control port,
    /// authenticates with the cookie, takes ownership, enables the network,
    /// and follows progress events until completion.  Safe to call on a
    /// system instance, where it is a no-op.
    pub fn bootstrap(&self, task: &Task) -> Result<()> {
        if self.state.lock().unwrap().bootstrapped {
            return Ok(());
        }
        let data_dir = self
            .data_dir
            .clone()
            .ok_or_else(|| Error::Fatal("bootstrap of a system tor".into()))?;

        // Wait for the daemon to write the control-port marker.
        let marker = data_dir.join("control_port");
        let mut marker_value = None;
        for _ in 0..CONTROL_PORT_TIMEOUT_SECS {
            task.check_canceled()?;
            match fs::read(&marker) {
                Ok(v) => {
                    marker_value = Some(v);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    thread::sleep(Duration::from_secs(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
        let Some(marker_value) = marker_value else {
            return Err(Error::Upstream(io::Error::new(
                io::ErrorKind::TimedOut,
                "timeout waiting for the control port",
            )));
        };
        debug!(
            "tor: control port is {}",
            String::from_utf8_lossy(&marker_value).trim()
        );

        task.update_progress("Connecting to the Tor control port.");
        let (ctrl, events) = CtrlConn::connect(&self.ctrl_endpoint)?;

        let cookie = fs::read(data_dir.join("control_auth_cookie"))?;
        ctrl.authenticate(Some(&hex::encode(cookie)))?;

        // Tie the daemon's lifetime to this control connection.
        info!("tor: taking ownership of the tor process");
        ctrl.request("TAKEOWNERSHIP")?;
        ctrl.request("SETEVENTS STATUS_CLIENT")?;

        task.update_progress("Connecting to the Tor network.");
        ctrl.request("RESETCONF DisableNetwork")?;

        let mut finished = false;
        let mut pct = 0u32;
        let mut ticks = 0u64;
        while ticks < BOOTSTRAP_TIMEOUT_SECS && !finished {
            task.check_canceled()?;

            let mut new_pct = 0u32;
            match events.recv_timeout(Duration::from_secs(1)) {
                Ok(ev) => {
                    let Some(status) = ev.reply.strip_prefix("STATUS_CLIENT ") else {
                        continue;
                    };
                    (finished, new_pct) = handle_bootstrap_event(task, status);
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Poll for a crashed daemon, and as a fallback for lost
                    // events, the bootstrap phase itself.
                    if let Some(process) = self.state.lock().unwrap().process.as_mut() {
                        if !process.running() {
                            return Err(Error::Upstream(io::Error::other(
                                "tor process appears to have crashed",
                            )));
                        }
                    }

                    ticks += 1;
                    if ticks % 10 != 0 {
                        continue;
                    }
                    let resp = ctrl.request("GETINFO status/bootstrap-phase")?;
                    if let Some(phase) = resp.getinfo_value("status/bootstrap-phase") {
                        (finished, new_pct) = handle_bootstrap_event(task, phase);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(not_running()),
            }

            // Forward progress resets the timer.
            if new_pct > pct {
                pct = new_pct;
                ticks = 0;
            }
        }
        if !finished {
            return Err(Error::Upstream(io::Error::new(
                io::ErrorKind::TimedOut,
                "timeout connecting to the tor network",
            )));
        }

        // Squelch the status events and drain anything queued.
        ctrl.request("SETEVENTS")?;
        while events.try_recv().is_ok() {}

        let mut state = self.state.lock().unwrap();
        state.ctrl = Some(ctrl);
        state.events = Some(events);
        state.bootstrapped = true;
        Ok(())
    }

    /// Starts the surrogate proxies the browser will be pointed at.
    pub fn launch_surrogates(
        self: &Arc<Self>,
        runtime_dir: &Path,
        circuit_display: bool,
    ) -> Result<()> {
        let tag = Arc::new(IsolationTag::new());
        let upstream = self.socks_endpoint()?;

        let socks = SocksSurrogate::launch(&runtime_dir.join("socks"), upstream.clone(), tag.clone())?;

        let events = self.take_events();
        let ctrl = match CtrlSurrogate::launch(
            &runtime_dir.join("control"),
            self.clone(),
            tag,
            circuit_display,
            events,
        ) {
            Ok(ctrl) => ctrl,
            Err(e) => {
                socks.close();
                return Err(e);
            }
        };

        // Non-browser tools on the host get a plain passthrough.
        let passthrough = if self.is_system {
            None
        } else {
            match PassthroughProxy::launch(PASSTHROUGH_ADDR, upstream) {
                Ok(p) => {
                    info!("tor: opened SOCKS passthrough listener: {PASSTHROUGH_ADDR}");
                    Some(p)
                }
                Err(e) => {
                    warn!("tor: failed to open SOCKS passthrough listener: {e}");
                    None
                }
            }
        };

        self.state.lock().unwrap().surrogates = Some(Surrogates {
            ctrl,
            socks,
            passthrough,
        });
        Ok(())
    }

    pub fn socks_surrogate_path(&self) -> Result<PathBuf> {
        let state = self.state.lock().unwrap();
        state
            .surrogates
            .as_ref()
            .map(|s| s.socks.path().to_path_buf())
            .ok_or_else(not_running)
    }

    pub fn ctrl_surrogate_path(&self) -> Result<PathBuf> {
        let state = self.state.lock().unwrap();
        state
            .surrogates
            .as_ref()
            .map(|s| s.ctrl.path().to_path_buf())
            .ok_or_else(not_running)
    }

    /// Gracefully tears the instance down.  A system tor only loses its
    /// control connection; a launcher-managed daemon is halted and, failing
    /// that, killed.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();

        let mut sent_halt = false;
        if let Some(ctrl) = state.ctrl.take() {
            if !self.is_system {
                let _ = ctrl.request("SIGNAL HALT");
                sent_halt = true;
            }
        }
        state.events = None;

        if let Some(mut process) = state.process.take() {
            if sent_halt {
                let mut exited = false;
                for _ in 0..HALT_GRACE_SECS {
                    if !process.running() {
                        exited = true;
                        break;
                    }
                    thread::sleep(Duration::from_secs(1));
                }
                if exited {
                    debug!("tor: process exited after HALT");
                } else {
                    debug!("tor: process timed out after HALT, killing");
                    process.kill();
                }
            } else {
                debug!("tor: process has no control port, killing");
                process.kill();
            }
        }

        if let Some(surrogates) = state.surrogates.take() {
            surrogates.ctrl.close();
            surrogates.socks.close();
            if let Some(p) = surrogates.passthrough {
                p.close();
            }
        }

        for path in state.unlink_on_exit.drain(..) {
            let _ = fs::remove_file(path);
        }
    }
}

fn handle_bootstrap_event(task: &Task, s: &str) -> (bool, u32) {
    let Some(rest) = s.strip_prefix("NOTICE BOOTSTRAP ") else {
        return (false, 0);
    };

    let mut progress = String::new();
    let mut summary = String::new();
    for field in split_quoted(rest) {
        if let Some(v) = field.strip_prefix("PROGRESS=") {
            progress = v.to_string();
        } else if let Some(v) = field.strip_prefix("SUMMARY=") {
            summary = v.trim_matches('"').to_string();
        }
    }
    let pct: u32 = progress.parse().unwrap_or(0);

    if !progress.is_empty() && !summary.is_empty() {
        task.update_progress(&format!("Bootstrap: {summary}"));
        if progress == "100" {
            return (true, pct);
        }
    }
    (false, pct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Stream;
    use std::os::unix::net::UnixStream;

    fn conn_pair() -> (Arc<CtrlConn>, Receiver<Response>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let stream = Stream::Unix(ours);
        let reader_stream = stream.try_clone().unwrap();

        let (reply_tx, reply_rx) = channel();
        let (event_tx, event_rx) = channel();
        thread::spawn(move || {
            let mut reader = BufReader::new(reader_stream);
            while let Ok(resp) = read_response(&mut reader) {
                if resp.status == 650 {
                    let _ = event_tx.send(resp);
                } else if reply_tx.send(resp).is_err() {
                    break;
                }
            }
        });
        let conn = Arc::new(CtrlConn {
            inner: Mutex::new(CtrlInner {
                stream,
                replies: reply_rx,
            }),
        });
        (conn, event_rx, theirs)
    }

    #[test]
    fn test_read_response_forms() {
        let text = "250-version=0.4.8.9\r\n250 OK\r\n";
        let mut r = BufReader::new(text.as_bytes());
        let resp = read_response(&mut r).unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.reply, "OK");
        assert_eq!(resp.raw_lines, vec!["250-version=0.4.8.9", "250 OK"]);
        assert_eq!(resp.getinfo_value("version"), Some("0.4.8.9"));

        let text = "250+circuit-status=\r\n1 BUILT\r\n2 BUILT\r\n.\r\n250 OK\r\n";
        let mut r = BufReader::new(text.as_bytes());
        let resp = read_response(&mut r).unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.data, vec!["1 BUILT", "2 BUILT"]);
        assert_eq!(resp.raw_lines.len(), 5);

        let text = "550 Unspecified Tor error\r\n";
        let mut r = BufReader::new(text.as_bytes());
        let resp = read_response(&mut r).unwrap();
        assert_eq!(resp.status, 550);

        let mut r = BufReader::new("garbage\r\n".as_bytes());
        assert!(read_response(&mut r).is_err());
    }

    #[test]
    fn test_request_reply_and_event_demux() {
        let (conn, events, mut daemon) = conn_pair();

        let jh = thread::spawn(move || {
            let mut reader = BufReader::new(daemon.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "GETINFO version\r\n");
            // An event arrives before the reply; the demux must keep them
            // apart.
            daemon
                .write_all(b"650 STREAM 1 SENTCONNECT 4 example.com:443\r\n")
                .unwrap();
            daemon
                .write_all(b"250-version=0.4.8.9\r\n250 OK\r\n")
                .unwrap();
        });

        let resp = conn.request("GETINFO version").unwrap();
        assert_eq!(resp.getinfo_value("version"), Some("0.4.8.9"));

        let ev = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ev.status, 650);
        assert!(ev.reply.starts_with("STREAM 1 SENTCONNECT"));
        jh.join().unwrap();
    }

    #[test]
    fn test_bootstrap_event_parsing() {
        let (task, _handle) = crate::task::new_task(|_| {});

        let (done, pct) = handle_bootstrap_event(
            &task,
            r#"NOTICE BOOTSTRAP PROGRESS=85 TAG=ap_conn_done SUMMARY="Handshaking""#,
        );
        assert!(!done);
        assert_eq!(pct, 85);

        let (done, pct) = handle_bootstrap_event(
            &task,
            r#"NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY="Done""#,
        );
        assert!(done);
        assert_eq!(pct, 100);

        let (done, _) = handle_bootstrap_event(&task, "NOTICE CIRCUIT_ESTABLISHED");
        assert!(!done);
    }
}
