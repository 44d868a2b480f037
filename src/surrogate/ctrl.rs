use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::tor::Tor;

use super::circuits::CircuitMonitor;
use super::socks::IsolationTag;

const CRLF: &str = "\r\n";

const RESPONSE_OK: &str = "250 OK\r\n";
const RESPONSE_CIRCUIT_STATUS: &str = "250+circuit-status=";

const ERR_AUTHENTICATION_REQUIRED: &str = "514 Authentication required\r\n";
const ERR_UNRECOGNIZED_COMMAND: &str = "510 Unrecognized command\r\n";
const ERR_UNSPECIFIED: &str = "550 Unspecified Tor error\r\n";

/// The browser must never learn the real SOCKS endpoint, so this entirely
/// synthetic listener address is advertised instead.
const SYNTHETIC_SOCKS_ADDR: &str = "127.0.0.1:9150";

const ARG_GETINFO_SOCKS: &str = "net/listeners/socks";
const ARG_GETINFO_CIRCUIT_STATUS: &str = "circuit-status";
const PREFIX_GETINFO_NS_ID: &str = "ns/id/";
const PREFIX_GETINFO_IP_TO_COUNTRY: &str = "ip-to-country/";
const ARG_GETCONF_BRIDGE: &str = "BRIDGE";
const EVENT_STREAM: &str = "STREAM";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    ProtocolInfo,
    Authenticate,
    AuthChallenge,
    Quit,
    GetInfo,
    GetConf,
    Signal,
    SetEvents,
    Unknown,
}

impl Command {
    fn parse(s: &str) -> Command {
        match s.to_uppercase().as_str() {
            "PROTOCOLINFO" => Command::ProtocolInfo,
            "AUTHENTICATE" => Command::Authenticate,
            "AUTHCHALLENGE" => Command::AuthChallenge,
            "QUIT" => Command::Quit,
            "GETINFO" => Command::GetInfo,
            "GETCONF" => Command::GetConf,
            "SIGNAL" => Command::Signal,
            "SETEVENTS" => Command::SetEvents,
            _ => Command::Unknown,
        }
    }
}

/// Serialized writes toward one control client; shared with the circuit
/// monitor for event broadcast.
pub struct ClientWriter(Mutex<UnixStream>);

impl ClientWriter {
    pub fn write(&self, b: &[u8]) -> io::Result<()> {
        self.0.lock().unwrap().write_all(b)
    }
}

struct Shared {
    tor: Arc<Tor>,
    tag: Arc<IsolationTag>,
    tor_version: String,
    monitor: Option<Arc<CircuitMonitor>>,
}

/// The control-port surrogate: pre-auth state machine, per-command filter,
/// synthetic responses, and (via the monitor) stream event relay.
pub struct CtrlSurrogate {
    path: PathBuf,
    listener: UnixListener,
    shared: Arc<Shared>,
}

impl CtrlSurrogate {
    pub fn launch(
        path: &Path,
        tor: Arc<Tor>,
        tag: Arc<IsolationTag>,
        circuit_display: bool,
        events: Option<std::sync::mpsc::Receiver<crate::tor::Response>>,
    ) -> Result<Arc<Self>> {
        // The browser does not normally use PROTOCOLINFO, but the synthetic
        // answer should carry the real version when it does.
        let tor_version = tor.version()?;

        let monitor = match (circuit_display, events) {
            (true, Some(events)) => {
                match CircuitMonitor::init(tor.clone(), tag.clone(), events) {
                    Ok(monitor) => Some(monitor),
                    Err(e) => {
                        warn!("ctrl: failed to launch the circuit monitor: {e}");
                        None
                    }
                }
            }
            _ => None,
        };

        let _ = fs::remove_file(path);
        let listener = UnixListener::bind(path)?;

        let surrogate = Arc::new(CtrlSurrogate {
            path: path.to_path_buf(),
            listener,
            shared: Arc::new(Shared {
                tor,
                tag,
                tor_version,
                monitor,
            }),
        });

        let accept = surrogate.clone();
        thread::spawn(move || accept.accept_loop());
        Ok(surrogate)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(&self) {
        let _ = fs::remove_file(&self.path);
        unsafe {
            libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
        }
    }

    fn accept_loop(self: Arc<Self>) {
        let mut next_id = 0u64;
        loop {
            match self.listener.accept() {
                Ok((conn, _)) => {
                    let id = next_id;
                    next_id += 1;
                    let shared = self.shared.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_conn(shared, conn, id) {
                            debug!("ctrl({id}): connection closed: {e}");
                        }
                    });
                }
                Err(e) => {
                    debug!("ctrl: accept loop exiting: {e}");
                    return;
                }
            }
        }
    }
}

struct ClientConn {
    shared: Arc<Shared>,
    id: u64,
    reader: BufReader<UnixStream>,
    writer: Arc<ClientWriter>,
}

fn handle_conn(shared: Arc<Shared>, conn: UnixStream, id: u64) -> Result<()> {
    let reader = BufReader::new(conn.try_clone()?);
    let mut client = ClientConn {
        shared,
        id,
        reader,
        writer: Arc::new(ClientWriter(Mutex::new(conn))),
    };

    let result = client.process_pre_auth().and_then(|()| client.process_commands());
    if let Some(monitor) = &client.shared.monitor {
        monitor.deregister(client.id);
    }
    result
}

impl ClientConn {
    /// Reads one CRLF-terminated command line.  Commands are
    /// case-insensitive with space-separated arguments.
    fn read_command(&mut self) -> Result<(Command, Vec<String>)> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(Error::Upstream(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed the connection",
            )));
        }
        let fields: Vec<String> = line.trim().split(' ').map(str::to_string).collect();
        let cmd = Command::parse(fields.first().map(String::as_str).unwrap_or(""));
        Ok((cmd, fields))
    }

    fn send(&self, response: &str) -> Result<()> {
        self.writer.write(response.as_bytes())?;
        Ok(())
    }

    /// PRE_AUTH: only PROTOCOLINFO (once) and AUTHENTICATE advance;
    /// anything else closes the connection.
    fn process_pre_auth(&mut self) -> Result<()> {
        let mut sent_protocolinfo = false;
        loop {
            let (cmd, fields) = self.read_command()?;
            match cmd {
                Command::ProtocolInfo => {
                    if sent_protocolinfo {
                        self.send(ERR_AUTHENTICATION_REQUIRED)?;
                        return Err(Error::Protocol(
                            "client already sent PROTOCOLINFO".into(),
                        ));
                    }
                    sent_protocolinfo = true;
                    self.on_protocolinfo(&fields)?;
                }
                Command::Authenticate => {
                    // Any credential is accepted; the surrogate is the trust
                    // boundary, not the authentication.
                    return self.send(RESPONSE_OK);
                }
                Command::AuthChallenge => {
                    // PROTOCOLINFO lies about the supported methods, so a
                    // client requesting a challenge is off-script.
                    self.send(ERR_UNRECOGNIZED_COMMAND)?;
                    return Err(Error::Protocol(
                        "client sent AUTHCHALLENGE, when not supported".into(),
                    ));
                }
                Command::Quit => {
                    return Err(Error::Protocol("client requested connection close".into()));
                }
                _ => {
                    self.send(ERR_AUTHENTICATION_REQUIRED)?;
                    return Err(Error::Protocol(format!(
                        "invalid pre-auth command: {:?}",
                        fields.first()
                    )));
                }
            }
        }
    }

    fn process_commands(&mut self) -> Result<()> {
        loop {
            let (cmd, fields) = self.read_command()?;
            debug!("ctrl({}): {:?}", self.id, fields.first());
            match cmd {
                Command::ProtocolInfo => self.on_protocolinfo(&fields)?,
                Command::GetInfo => self.on_getinfo(&fields)?,
                Command::GetConf => self.on_getconf(&fields)?,
                Command::Signal => self.on_signal(&fields)?,
                Command::SetEvents => self.on_setevents(&fields)?,
                _ => self.send(ERR_UNRECOGNIZED_COMMAND)?,
            }
        }
    }

    fn send_arg_count_error(&self, cmd: &str, expected: usize, actual: usize) -> Result<()> {
        let msg = if actual > expected {
            format!("512 Too many arguments to {cmd}{CRLF}")
        } else {
            format!("512 Missing argument to {cmd}{CRLF}")
        };
        self.send(&msg)
    }

    fn on_protocolinfo(&self, fields: &[String]) -> Result<()> {
        for version in &fields[1..] {
            if version.parse::<i32>().is_err() {
                return self.send(&format!("513 No such version \"{version}\"{CRLF}"));
            }
        }
        self.send(&format!(
            "250-PROTOCOLINFO 1{CRLF}\
             250-AUTH METHODS=NULL,HASHEDPASSWORD{CRLF}\
             250-VERSION Tor=\"{}\"{CRLF}\
             {RESPONSE_OK}",
            self.shared.tor_version
        ))
    }

    fn on_getinfo(&self, fields: &[String]) -> Result<()> {
        if fields.len() != 2 {
            return self.send_arg_count_error("GETINFO", 2, fields.len());
        }
        let key = &fields[1];

        let monitor_enabled = self.shared.monitor.is_some();
        if monitor_enabled
            && (key.starts_with(PREFIX_GETINFO_NS_ID)
                || key.starts_with(PREFIX_GETINFO_IP_TO_COUNTRY))
        {
            // Filtering these to the circuits the user actually has would,
            // ironically, leak more than forwarding them does.
            return match self.shared.tor.getinfo(key) {
                Ok(resp) => self.send(&(resp.raw_lines.join(CRLF) + CRLF)),
                Err(_) => self.send(ERR_UNSPECIFIED),
            };
        }

        match key.as_str() {
            ARG_GETINFO_SOCKS => self.send(&format!(
                "250-{ARG_GETINFO_SOCKS}=\"{SYNTHETIC_SOCKS_ADDR}\"{CRLF}{RESPONSE_OK}"
            )),
            ARG_GETINFO_CIRCUIT_STATUS if monitor_enabled => {
                let monitor = self.shared.monitor.as_ref().unwrap();
                let mut lines = vec![RESPONSE_CIRCUIT_STATUS.to_string()];
                lines.extend(monitor.circuit_status());
                lines.push(".".to_string());
                lines.push(RESPONSE_OK.to_string());
                self.send(&lines.join(CRLF))
            }
            _ => self.send(&format!("552 Unrecognized key \"{key}\"{CRLF}")),
        }
    }

    fn on_getconf(&self, fields: &[String]) -> Result<()> {
        if fields.len() != 2 {
            return self.send_arg_count_error("GETCONF", 2, fields.len());
        }
        let key = &fields[1];

        if key.to_uppercase() == ARG_GETCONF_BRIDGE && self.shared.monitor.is_some() {
            return match self.shared.tor.getconf(key) {
                Ok(resp) => self.send(&(resp.raw_lines.join(CRLF) + CRLF)),
                Err(_) => self.send(ERR_UNSPECIFIED),
            };
        }
        self.send(&format!(
            "552 Unrecognized configuration key \"{key}\"{CRLF}"
        ))
    }

    fn on_signal(&self, fields: &[String]) -> Result<()> {
        if fields.len() != 2 {
            return self.send_arg_count_error("SIGNAL", 2, fields.len());
        }
        if fields[1].to_uppercase() != "NEWNYM" {
            return self.send(&format!(
                "552 Unrecognized signal code \"{}\"{CRLF}",
                fields[1]
            ));
        }

        // A fresh tag first, so circuits built for the old identity vanish
        // from the filtered view, then the real signal.
        self.shared.tag.rotate();
        if self.shared.tor.newnym().is_err() {
            return self.send(ERR_UNSPECIFIED);
        }
        self.send(RESPONSE_OK)
    }

    fn on_setevents(&self, fields: &[String]) -> Result<()> {
        let Some(monitor) = &self.shared.monitor else {
            return self.send(ERR_UNRECOGNIZED_COMMAND);
        };

        if fields.len() == 1 {
            monitor.deregister(self.id);
            return self.send(RESPONSE_OK);
        }
        if fields.len() != 2 {
            // The browser only ever uses `SETEVENTS STREAM`.
            return self.send_arg_count_error("SETEVENTS", 2, fields.len());
        }
        if fields[1].to_uppercase() != EVENT_STREAM {
            return self.send(&format!(
                "552 Unrecognized event \"{}\"{CRLF}",
                fields[1]
            ));
        }
        monitor.register(self.id, self.writer.clone());
        self.send(RESPONSE_OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Endpoint;
    use std::io::Read;
    use std::time::Duration;

    /// A canned control daemon, enough for Tor::system and the surrogate.
    fn fake_daemon(dir: &Path) -> PathBuf {
        let path = dir.join("daemon-ctrl");
        let listener = UnixListener::bind(&path).unwrap();
        thread::spawn(move || {
            while let Ok((conn, _)) = listener.accept() {
                thread::spawn(move || serve_daemon(conn));
            }
        });
        path
    }

    fn serve_daemon(conn: UnixStream) {
        let mut reader = BufReader::new(conn.try_clone().unwrap());
        let mut conn = conn;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                return;
            }
            let line = line.trim();
            let reply: String = if line.starts_with("AUTHENTICATE") {
                RESPONSE_OK.into()
            } else if line == "GETINFO version" {
                format!("250-version=0.4.8.9{CRLF}{RESPONSE_OK}")
            } else if line == "GETINFO net/listeners/socks" {
                format!("250-net/listeners/socks=\"unix:/run/tor/socks\"{CRLF}{RESPONSE_OK}")
            } else if line.starts_with("GETINFO ns/id/") {
                format!("250+ns/id/moria1={CRLF}r moria1{CRLF}.{CRLF}{RESPONSE_OK}")
            } else if line == "SIGNAL NEWNYM" || line.starts_with("SETEVENTS") {
                RESPONSE_OK.into()
            } else {
                format!("552 Unrecognized key{CRLF}")
            };
            if conn.write_all(reply.as_bytes()).is_err() {
                return;
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        tag: Arc<IsolationTag>,
        surrogate: Arc<CtrlSurrogate>,
    }

    fn fixture(circuit_display: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let daemon_path = fake_daemon(dir.path());
        let tor = Tor::system(Endpoint::Unix(daemon_path)).unwrap();
        let tag = Arc::new(IsolationTag::new());
        let events = tor.take_events();
        let surrogate = CtrlSurrogate::launch(
            &dir.path().join("control"),
            tor,
            tag.clone(),
            circuit_display,
            events,
        )
        .unwrap();
        Fixture {
            _dir: dir,
            tag,
            surrogate,
        }
    }

    struct Client {
        reader: BufReader<UnixStream>,
        conn: UnixStream,
    }

    impl Client {
        fn connect(surrogate: &CtrlSurrogate) -> Client {
            let conn = UnixStream::connect(surrogate.path()).unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            Client {
                reader: BufReader::new(conn.try_clone().unwrap()),
                conn,
            }
        }

        fn send(&mut self, line: &str) {
            self.conn.write_all(line.as_bytes()).unwrap();
            self.conn.write_all(b"\r\n").unwrap();
        }

        fn read_line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            line
        }

        fn authenticate(&mut self) {
            self.send("AUTHENTICATE");
            assert_eq!(self.read_line(), RESPONSE_OK);
        }
    }

    #[test]
    fn test_pre_auth_machine() {
        let fx = fixture(false);

        // PROTOCOLINFO once is fine and carries the real version.
        let mut c = Client::connect(&fx.surrogate);
        c.send("PROTOCOLINFO");
        assert_eq!(c.read_line(), format!("250-PROTOCOLINFO 1{CRLF}"));
        assert_eq!(
            c.read_line(),
            format!("250-AUTH METHODS=NULL,HASHEDPASSWORD{CRLF}")
        );
        assert_eq!(c.read_line(), format!("250-VERSION Tor=\"0.4.8.9\"{CRLF}"));
        assert_eq!(c.read_line(), RESPONSE_OK);

        // Twice before AUTHENTICATE is rejected and the connection closed.
        c.send("PROTOCOLINFO");
        assert_eq!(c.read_line(), ERR_AUTHENTICATION_REQUIRED);
        assert_eq!(c.read_line(), "");

        // Any other pre-auth command closes too.
        let mut c = Client::connect(&fx.surrogate);
        c.send("GETINFO version");
        assert_eq!(c.read_line(), ERR_AUTHENTICATION_REQUIRED);
        assert_eq!(c.read_line(), "");
    }

    #[test]
    fn test_getinfo_filter() {
        let fx = fixture(false);
        let mut c = Client::connect(&fx.surrogate);
        c.authenticate();

        // The SOCKS listener is synthetic.
        c.send("GETINFO net/listeners/socks");
        assert_eq!(
            c.read_line(),
            format!("250-net/listeners/socks=\"127.0.0.1:9150\"{CRLF}")
        );
        assert_eq!(c.read_line(), RESPONSE_OK);

        // Everything not on the allow-list is rejected, including the keys
        // that would be forwarded with the circuit display enabled.
        c.send("GETINFO version");
        assert_eq!(c.read_line(), format!("552 Unrecognized key \"version\"{CRLF}"));
        c.send("GETINFO ns/id/moria1");
        assert_eq!(
            c.read_line(),
            format!("552 Unrecognized key \"ns/id/moria1\"{CRLF}")
        );

        c.send("GETINFO");
        assert_eq!(c.read_line(), format!("512 Missing argument to GETINFO{CRLF}"));
    }

    #[test]
    fn test_getinfo_forwards_with_circuit_display() {
        let fx = fixture(true);
        let mut c = Client::connect(&fx.surrogate);
        c.authenticate();

        c.send("GETINFO ns/id/moria1");
        assert_eq!(c.read_line(), format!("250+ns/id/moria1={CRLF}"));
        assert_eq!(c.read_line(), format!("r moria1{CRLF}"));
        assert_eq!(c.read_line(), format!(".{CRLF}"));
        assert_eq!(c.read_line(), RESPONSE_OK);

        // circuit-status is served from the (empty) monitor cache.
        c.send("GETINFO circuit-status");
        assert_eq!(c.read_line(), format!("250+circuit-status={CRLF}"));
        assert_eq!(c.read_line(), format!(".{CRLF}"));
        assert_eq!(c.read_line(), RESPONSE_OK);
    }

    #[test]
    fn test_newnym_rotates_tag() {
        let fx = fixture(false);
        let mut c = Client::connect(&fx.surrogate);
        c.authenticate();

        let before = fx.tag.suffix();
        c.send("SIGNAL NEWNYM");
        assert_eq!(c.read_line(), RESPONSE_OK);
        assert_ne!(fx.tag.suffix(), before);

        c.send("SIGNAL HUP");
        assert_eq!(
            c.read_line(),
            format!("552 Unrecognized signal code \"HUP\"{CRLF}")
        );
    }

    #[test]
    fn test_unknown_commands_and_setevents() {
        let fx = fixture(false);
        let mut c = Client::connect(&fx.surrogate);
        c.authenticate();

        c.send("RESOLVE example.com");
        assert_eq!(c.read_line(), ERR_UNRECOGNIZED_COMMAND);

        // The monitor is disabled, so SETEVENTS is not recognized at all.
        c.send("SETEVENTS STREAM");
        assert_eq!(c.read_line(), ERR_UNRECOGNIZED_COMMAND);
    }

    #[test]
    fn test_setevents_with_monitor() {
        let fx = fixture(true);
        let mut c = Client::connect(&fx.surrogate);
        c.authenticate();

        c.send("SETEVENTS STREAM");
        assert_eq!(c.read_line(), RESPONSE_OK);
        c.send("SETEVENTS");
        assert_eq!(c.read_line(), RESPONSE_OK);
        c.send("SETEVENTS CIRC");
        assert_eq!(
            c.read_line(),
            format!("552 Unrecognized event \"CIRC\"{CRLF}")
        );
    }
}
