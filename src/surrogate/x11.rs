use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::sandbox::x11::AuthRecord;

const PROTOCOL_MAJOR: u16 = 11;
const PROTOCOL_MINOR: u16 = 0;

const OP_GENERIC_EVENT: u8 = 35;
const OP_QUERY_EXTENSION: u8 = 98;
const OP_LIST_EXTENSIONS: u8 = 99;
const OP_NO_OPERATION: u8 = 127;
const OP_EXTENSION_BASE: u8 = 128;

const ERR_REQUEST: u8 = 1;

const REP_ERROR: u8 = 0;
const REP_REPLY: u8 = 1;

/// Extensions the browser may see and use.
///
/// Not listed, apparently unused but not obviously horrific:
/// DOUBLE-BUFFER, DPMS, MIT-SCREEN-SAVER, Present, SGI-GLX, X-Resource,
/// XC-MISC, XFree86-DGA, XFree86-VidModeExtension, XVideo.
/// Unsafe: DRI2, DRI3, RECORD, SECURITY, XTEST.
/// Cannot work across the namespace boundary: MIT-SHM.
pub const EXTENSION_ALLOWLIST: &[&str] = &[
    "BIG-REQUESTS",
    "Composite",
    "DAMAGE",
    "GLX",
    "Generic Event Extension",
    "RANDR",
    "RENDER",
    "SHAPE",
    "SYNC",
    "XFIXES",
    "XINERAMA",
    "XInputExtension",
    "XKEYBOARD",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    fn u16(self, b: &[u8]) -> u16 {
        let raw = [b[0], b[1]];
        match self {
            ByteOrder::Big => u16::from_be_bytes(raw),
            ByteOrder::Little => u16::from_le_bytes(raw),
        }
    }

    fn u32(self, b: &[u8]) -> u32 {
        let raw = [b[0], b[1], b[2], b[3]];
        match self {
            ByteOrder::Big => u32::from_be_bytes(raw),
            ByteOrder::Little => u32::from_le_bytes(raw),
        }
    }

    fn put_u16(self, b: &mut [u8], v: u16) {
        let raw = match self {
            ByteOrder::Big => v.to_be_bytes(),
            ByteOrder::Little => v.to_le_bytes(),
        };
        b[..2].copy_from_slice(&raw);
    }
}

/// The server-assigned major opcodes for allow-listed extensions, recorded
/// once from the probe connection and read-only for every client after.
#[derive(Debug, Default)]
pub struct ExtensionTable {
    by_opcode: HashMap<u8, String>,
    by_name: HashMap<String, u8>,
}

impl ExtensionTable {
    fn insert(&mut self, name: &str, opcode: u8) {
        self.by_opcode.insert(opcode, name.to_string());
        self.by_name.insert(name.to_string(), opcode);
    }

    pub fn allows_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn allows_opcode(&self, opcode: u8) -> bool {
        self.by_opcode.contains_key(&opcode)
    }

    #[cfg(test)]
    pub(crate) fn from_entries(entries: &[(&str, u8)]) -> Self {
        let mut table = ExtensionTable::default();
        for (name, op) in entries {
            table.insert(name, *op);
        }
        table
    }
}

/// Queries the real server for the opcode of every allow-listed extension.
/// This is a plain client connection speaking the same wire format the
/// proxy filters.
pub fn probe_extension_opcodes(
    server_socket: &Path,
    auth: Option<&AuthRecord>,
) -> Result<ExtensionTable> {
    let mut conn = UnixStream::connect(server_socket)?;
    let order = ByteOrder::Little;

    let (auth_name, auth_data): (&[u8], &[u8]) = match auth {
        Some(a) => (&a.method, &a.data),
        None => (&[], &[]),
    };

    // Connection setup request.
    let mut setup = vec![0u8; 12];
    setup[0] = 0x6c;
    order.put_u16(&mut setup[2..], PROTOCOL_MAJOR);
    order.put_u16(&mut setup[4..], PROTOCOL_MINOR);
    order.put_u16(&mut setup[6..], auth_name.len() as u16);
    order.put_u16(&mut setup[8..], auth_data.len() as u16);
    conn.write_all(&setup)?;
    for chunk in [auth_name, auth_data] {
        conn.write_all(chunk)?;
        conn.write_all(&[0u8; 3][..pad(chunk.len())])?;
    }

    // Setup reply: status, then ad_length * 4 bytes to skip.
    let mut hdr = [0u8; 8];
    conn.read_exact(&mut hdr)?;
    let ad_len = order.u16(&hdr[6..]) as u64 * 4;
    discard_n(&mut conn, ad_len)?;
    check_setup_status(hdr[0])?;

    let mut table = ExtensionTable::default();
    for name in EXTENSION_ALLOWLIST {
        let body_len = 4 + name.len() + pad(name.len());
        let mut req = [0u8; 4];
        req[0] = OP_QUERY_EXTENSION;
        order.put_u16(&mut req[2..], ((4 + body_len) / 4) as u16);
        let mut body = vec![0u8; body_len];
        order.put_u16(&mut body[..2], name.len() as u16);
        body[4..4 + name.len()].copy_from_slice(name.as_bytes());
        conn.write_all(&req)?;
        conn.write_all(&body)?;

        let mut reply = [0u8; 32];
        conn.read_exact(&mut reply)?;
        if reply[0] == REP_REPLY {
            let extra = order.u32(&reply[4..]) as u64 * 4;
            discard_n(&mut conn, extra)?;
            let present = reply[8] == 1;
            let opcode = reply[9];
            if present && opcode > 0 {
                debug!("x11: extension {name:?} -> {opcode}");
                table.insert(name, opcode);
            } else {
                debug!("x11: extension {name:?} -> not supported");
            }
        } else {
            debug!("x11: extension {name:?} -> error reply");
        }
    }
    Ok(table)
}

fn check_setup_status(status: u8) -> Result<()> {
    match status {
        0 => Err(Error::Protocol("X11 server refused connection".into())),
        1 => Ok(()),
        // Nothing observed in the wild needs the Authenticate dance.
        2 => Err(Error::Protocol(
            "X11 server requires additional authentication".into(),
        )),
        n => Err(Error::Protocol(format!(
            "X11 server returned unknown connection status: {n}"
        ))),
    }
}

/// The X11 surrogate listener.
pub struct X11Surrogate {
    path: PathBuf,
    server_socket: PathBuf,
    listener: UnixListener,
    table: Arc<ExtensionTable>,
}

impl X11Surrogate {
    /// Probes the real server for the extension-opcode table and starts
    /// accepting client connections on `listen_path`.
    pub fn launch(
        server_socket: &Path,
        listen_path: &Path,
        auth: Option<&AuthRecord>,
    ) -> Result<Arc<Self>> {
        let table = Arc::new(probe_extension_opcodes(server_socket, auth)?);

        let _ = fs::remove_file(listen_path);
        let listener = UnixListener::bind(listen_path)?;

        let surrogate = Arc::new(X11Surrogate {
            path: listen_path.to_path_buf(),
            server_socket: server_socket.to_path_buf(),
            listener,
            table,
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
        let mut next_id = 0usize;
        loop {
            match self.listener.accept() {
                Ok((client, _)) => {
                    let id = next_id;
                    next_id += 1;
                    debug!("x11({id}): new connection");

                    let server_socket = self.server_socket.clone();
                    let table = self.table.clone();
                    thread::spawn(move || {
                        let Ok(server) = UnixStream::connect(&server_socket) else {
                            return;
                        };
                        proxy_conn(client, server, table, id);
                    });
                }
                Err(e) => {
                    debug!("x11: accept loop exiting: {e}");
                    return;
                }
            }
        }
    }
}

struct ReplyRewrite {
    seq: u16,
    body: [u8; 32],
    reason: String,
}

/// State shared between the two pump threads of one proxied connection.
struct ConnShared {
    id: usize,
    order: ByteOrder,
    /// Both the forward path and the injection path write to the client, so
    /// those writes are serialized here.
    client_w: Mutex<UnixStream>,
    rewrites: Mutex<VecDeque<ReplyRewrite>>,
}

impl ConnShared {
    /// Injects a synthetic 32-byte reply toward the client.
    ///
    /// The client library asserts on out-of-order replies even though it
    /// could cope; the delay is a pragmatic serialization barrier keeping
    /// the injected reply clear of in-flight traffic.
    fn inject_reply(&self, body: &[u8; 32]) -> io::Result<()> {
        thread::sleep(Duration::from_millis(100));

        let mut client = self.client_w.lock().unwrap();
        debug!("x11({}): injected reply", self.id);
        client.write_all(body)
    }
}

/// Runs both directions of one proxied connection to completion.
fn proxy_conn(client: UnixStream, server: UnixStream, table: Arc<ExtensionTable>, id: usize) {
    match proxy_setup(&client, &server, id) {
        Ok(order) => {
            let shared = Arc::new(ConnShared {
                id,
                order,
                client_w: Mutex::new(match client.try_clone() {
                    Ok(c) => c,
                    Err(_) => return,
                }),
                rewrites: Mutex::new(VecDeque::new()),
            });

            let down = {
                let shared = shared.clone();
                let server = match server.try_clone() {
                    Ok(s) => s,
                    Err(_) => return,
                };
                let client = match client.try_clone() {
                    Ok(c) => c,
                    Err(_) => return,
                };
                thread::spawn(move || {
                    let mut pump = ServerPump {
                        shared,
                        server_r: server,
                    };
                    let e = pump.run();
                    debug!("x11({id}): server pump exiting: {e}");
                    teardown(&pump.server_r, &client);
                })
            };

            let mut pump = ClientPump {
                shared,
                table,
                client_r: client,
                server_w: server,
                req_seq: 1,
            };
            let e = pump.run();
            debug!("x11({id}): client pump exiting: {e}");
            teardown(&pump.client_r, &pump.server_w);
            let _ = down.join();
        }
        Err(e) => {
            debug!("x11({id}): connection setup failed: {e}");
        }
    }
}

/// Passes the connection-setup exchange through, learning the byte order.
fn proxy_setup(mut client: &UnixStream, mut server: &UnixStream, id: usize) -> Result<ByteOrder> {
    // uint8  byte order ('B' = BE, 'l' = LE)
    // uint8  unused
    // uint16 protocol_major, protocol_minor
    // uint16 n (auth protocol name length)
    // uint16 d (auth protocol data length)
    // uint16 unused
    let mut hdr = [0u8; 12];
    client.read_exact(&mut hdr)?;

    let order = match hdr[0] {
        0x42 => ByteOrder::Big,
        0x6c => ByteOrder::Little,
        _ => return Err(Error::Protocol("unable to determine byte order".into())),
    };

    let major = order.u16(&hdr[2..]);
    let minor = order.u16(&hdr[4..]);
    debug!("x11({id}): protocol {major}.{minor}");
    if major != PROTOCOL_MAJOR || minor != PROTOCOL_MINOR {
        return Err(Error::Protocol(format!(
            "unsupported X protocol: {major}.{minor}"
        )));
    }

    let n = order.u16(&hdr[6..]) as u64;
    let d = order.u16(&hdr[8..]) as u64;

    server.write_all(&hdr)?;
    // Authorization name and data, each padded to 4 bytes.
    copy_n(&mut server, &mut client, n + pad(n as usize) as u64 + d + pad(d as usize) as u64)?;

    // The server's reply: only the status and the additional-data length
    // matter here.
    let mut reply = [0u8; 8];
    server.read_exact(&mut reply)?;
    let ad_len = order.u16(&reply[6..]) as u64 * 4;

    client.write_all(&reply)?;
    copy_n(&mut client, &mut server, ad_len)?;

    check_setup_status(reply[0])?;
    Ok(order)
}

/// Client -> server: parses requests, schedules reply rewrites, rejects
/// proscribed extension requests in-band.
struct ClientPump {
    shared: Arc<ConnShared>,
    table: Arc<ExtensionTable>,
    client_r: UnixStream,
    server_w: UnixStream,
    req_seq: u16,
}

impl ClientPump {
    fn run(&mut self) -> Error {
        loop {
            if let Err(e) = self.consume_request() {
                return e;
            }
        }
    }

    fn consume_request(&mut self) -> Result<()> {
        let order = self.shared.order;

        // uint8  opcode
        // uint8  detail
        // uint16 length (4-byte units, header included; 0 = BIG-REQUESTS)
        let mut hdr = [0u8; 8];
        let mut hdr_len = 4usize;
        self.client_r.read_exact(&mut hdr[..4])?;
        let opcode = hdr[0];

        let mut req_len = order.u16(&hdr[2..]) as u64 * 4;
        if req_len == 0 {
            // BIG-REQUESTS framing: a 32-bit length follows.  Strictly the
            // extension must be enabled first, but accepting it blindly is
            // not harmful.
            self.client_r.read_exact(&mut hdr[4..])?;
            req_len = order.u32(&hdr[4..]) as u64 * 4;
            hdr_len = 8;
        }
        if req_len < hdr_len as u64 {
            return Err(Error::Protocol(format!("invalid request length: {req_len}")));
        }
        let body_len = req_len - hdr_len as u64;

        let mut body: Option<Vec<u8>> = None;
        let mut reject = false;

        match opcode {
            OP_QUERY_EXTENSION => {
                // uint16 n, uint16 unused, name[n], pad
                let mut buf = vec![0u8; body_len as usize];
                self.client_r.read_exact(&mut buf)?;

                let name = (buf.len() >= 4)
                    .then(|| {
                        let n = order.u16(&buf[..2]) as usize;
                        buf.get(4..4 + n)
                    })
                    .flatten()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .ok_or_else(|| Error::Protocol("malformed QueryExtension".into()))?;

                debug!(
                    "x11({}): req(#{:05}): QueryExtension {name:?}",
                    self.shared.id, self.req_seq
                );
                if !self.table.allows_name(&name) {
                    self.schedule_query_extension_rewrite(name);
                }
                body = Some(buf);
            }
            OP_LIST_EXTENSIONS => {
                // Harmless on its own; using anything it names still takes a
                // QueryExtension, which is where the policy bites.
                debug!(
                    "x11({}): req(#{:05}): ListExtensions",
                    self.shared.id, self.req_seq
                );
            }
            op if op >= OP_EXTENSION_BASE => {
                if !self.table.allows_opcode(op) {
                    warn!("x11: rejecting prohibited request: {op}");
                    self.inject_request_error(op)?;
                    reject = true;
                }
            }
            _ => {}
        }

        if !reject {
            self.server_w.write_all(&hdr[..hdr_len])?;
            match body {
                Some(body) => self.server_w.write_all(&body)?,
                None => copy_n(&mut self.server_w, &mut self.client_r, body_len)?,
            }
        } else {
            // A NoOperation takes the rejected request's place so the
            // server's sequence counter stays in step, and the unread body
            // is dropped.
            self.inject_no_operation()?;
            discard_n(&mut self.client_r, body_len)?;
        }

        self.req_seq = self.req_seq.wrapping_add(1);
        Ok(())
    }

    /// Queues a replacement QueryExtension reply declaring the extension
    /// absent.  The original request is still forwarded to keep the
    /// sequence numbers in step.
    fn schedule_query_extension_rewrite(&self, name: String) {
        let order = self.shared.order;

        // uint8  resp_type (1 = Reply)
        // uint8  unused
        // uint16 sequence_number
        // uint32 reply_length (0)
        // uint8  present (0), major_opcode (0), first_event (0), first_error (0)
        let mut body = [0u8; 32];
        body[0] = REP_REPLY;
        order.put_u16(&mut body[2..], self.req_seq);

        debug!(
            "x11({}): scheduling QueryExtension rejection: {name:?}",
            self.shared.id
        );
        self.shared.rewrites.lock().unwrap().push_back(ReplyRewrite {
            seq: self.req_seq,
            body,
            reason: format!("QueryExtension rejection: {name}"),
        });
    }

    /// Sends the client a synthetic `Error(Request)` for the rejected
    /// request.
    fn inject_request_error(&self, opcode: u8) -> Result<()> {
        let order = self.shared.order;

        // uint8  resp_type (0 = Error)
        // uint8  code (1 = Request)
        // uint16 sequence_number
        // uint8  unused[4]
        // uint16 minor_opcode
        // uint8  major_opcode
        let mut rep = [0u8; 32];
        rep[0] = REP_ERROR;
        rep[1] = ERR_REQUEST;
        order.put_u16(&mut rep[2..], self.req_seq);
        rep[10] = opcode;

        self.shared.inject_reply(&rep)?;
        Ok(())
    }

    fn inject_no_operation(&mut self) -> Result<()> {
        let order = self.shared.order;

        let mut req = [0u8; 4];
        req[0] = OP_NO_OPERATION;
        order.put_u16(&mut req[2..], 1);
        self.server_w.write_all(&req)?;
        Ok(())
    }
}

/// Server -> client: applies pending reply rewrites, forwards everything
/// else.
struct ServerPump {
    shared: Arc<ConnShared>,
    server_r: UnixStream,
}

impl ServerPump {
    fn run(&mut self) -> Error {
        loop {
            if let Err(e) = self.consume_reply() {
                return e;
            }
        }
    }

    fn consume_reply(&mut self) -> Result<()> {
        let order = self.shared.order;

        // uint8  resp_type (0 = Error, 1 = Reply, ... = Event)
        // uint8  detail
        // uint16 sequence_number
        // uint32 reply_length (4-byte units, Reply and GenericEvent only)
        let mut hdr = [0u8; 32];
        self.server_r.read_exact(&mut hdr)?;

        let mut rep_len = 0u64;
        if hdr[0] == REP_REPLY || hdr[0] == OP_GENERIC_EVENT {
            rep_len = order.u32(&hdr[4..]) as u64 * 4;
        }
        let seq = order.u16(&hdr[2..]);

        // Queue entries pop strictly in FIFO order, on the reply or error
        // carrying their sequence number.
        let rewrite = {
            let mut queue = self.shared.rewrites.lock().unwrap();
            match queue.front() {
                Some(head) if head.seq == seq => match hdr[0] {
                    REP_REPLY => queue.pop_front(),
                    REP_ERROR => {
                        queue.pop_front();
                        None
                    }
                    _ => {
                        debug!(
                            "x11({}): rep(#{seq:05}): event while expecting reply or error",
                            self.shared.id
                        );
                        None
                    }
                },
                _ => None,
            }
        };

        if let Some(rewrite) = rewrite {
            debug!(
                "x11({}): rep(#{seq:05}): rewriting reply: {}",
                self.shared.id, rewrite.reason
            );
            discard_n(&mut self.server_r, rep_len)?;
            let mut client = self.shared.client_w.lock().unwrap();
            client.write_all(&rewrite.body)?;
            return Ok(());
        }

        let mut client = self.shared.client_w.lock().unwrap();
        client.write_all(&hdr)?;
        copy_n(&mut *client, &mut self.server_r, rep_len)?;
        Ok(())
    }
}

fn teardown(a: &UnixStream, b: &UnixStream) {
    let _ = a.shutdown(Shutdown::Both);
    let _ = b.shutdown(Shutdown::Both);
}

fn pad(n: usize) -> usize {
    (4 - (n & 0x3)) & 0x3
}

fn copy_n<W: Write, R: Read>(dst: &mut W, src: &mut R, mut n: u64) -> Result<()> {
    let mut buf = [0u8; 4096];
    while n > 0 {
        let want = buf.len().min(n as usize);
        let got = crate::utils::retry_on_interrupt(|| src.read(&mut buf[..want]))?;
        if got == 0 {
            return Err(Error::Upstream(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short copy",
            )));
        }
        dst.write_all(&buf[..got])?;
        n -= got as u64;
    }
    Ok(())
}

fn discard_n<R: Read>(src: &mut R, n: u64) -> Result<()> {
    copy_n(&mut io::sink(), src, n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_proxy(table: ExtensionTable) -> (UnixStream, UnixStream) {
        let (client, proxy_client) = UnixStream::pair().unwrap();
        let (proxy_server, server) = UnixStream::pair().unwrap();
        thread::spawn(move || proxy_conn(proxy_client, proxy_server, Arc::new(table), 0));
        (client, server)
    }

    /// Drives both sides of the connection setup, little-endian.
    fn do_setup(client: &mut UnixStream, server: &mut UnixStream) {
        let mut hdr = [0u8; 12];
        hdr[0] = 0x6c;
        hdr[2..4].copy_from_slice(&11u16.to_le_bytes());
        client.write_all(&hdr).unwrap();

        let mut fwd = [0u8; 12];
        server.read_exact(&mut fwd).unwrap();
        assert_eq!(fwd, hdr);

        let mut reply = [0u8; 8];
        reply[0] = 1; // Success, no additional data.
        server.write_all(&reply).unwrap();

        let mut got = [0u8; 8];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, reply);
    }

    fn query_extension_request(name: &str) -> Vec<u8> {
        let body_len = 4 + name.len() + pad(name.len());
        let mut req = vec![0u8; 4 + body_len];
        req[0] = OP_QUERY_EXTENSION;
        req[2..4].copy_from_slice(&(((4 + body_len) / 4) as u16).to_le_bytes());
        req[4..6].copy_from_slice(&(name.len() as u16).to_le_bytes());
        req[8..8 + name.len()].copy_from_slice(name.as_bytes());
        req
    }

    #[test]
    fn test_pad() {
        assert_eq!(pad(0), 0);
        assert_eq!(pad(1), 3);
        assert_eq!(pad(2), 2);
        assert_eq!(pad(3), 1);
        assert_eq!(pad(4), 0);
    }

    #[test]
    fn test_query_extension_rejection_rewrites_reply() {
        let (mut client, mut server) =
            start_proxy(ExtensionTable::from_entries(&[("RENDER", 139)]));
        do_setup(&mut client, &mut server);

        client.write_all(&query_extension_request("DRI3")).unwrap();

        // The server still sees the request, so its sequence counter
        // advances, and it answers truthfully.
        let mut fwd = vec![0u8; 4 + 4 + 4];
        server.read_exact(&mut fwd).unwrap();
        assert_eq!(fwd[0], OP_QUERY_EXTENSION);
        assert_eq!(&fwd[8..12], b"DRI3");

        let mut reply = [0u8; 32];
        reply[0] = REP_REPLY;
        reply[2..4].copy_from_slice(&1u16.to_le_bytes());
        reply[8] = 1; // present
        reply[9] = 155; // major opcode
        server.write_all(&reply).unwrap();

        // The client sees the rewritten answer: not present, no opcodes.
        let mut got = [0u8; 32];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got[0], REP_REPLY);
        assert_eq!(u16::from_le_bytes([got[2], got[3]]), 1);
        assert_eq!(got[8], 0, "present must be rewritten to 0");
        assert_eq!(got[9], 0, "major_opcode must be rewritten to 0");
        assert_eq!(got[10], 0);
        assert_eq!(got[11], 0);
    }

    #[test]
    fn test_allowed_query_extension_passes_through() {
        let (mut client, mut server) =
            start_proxy(ExtensionTable::from_entries(&[("RENDER", 139)]));
        do_setup(&mut client, &mut server);

        client.write_all(&query_extension_request("RENDER")).unwrap();

        let mut fwd = vec![0u8; 4 + 4 + 8];
        server.read_exact(&mut fwd).unwrap();

        let mut reply = [0u8; 32];
        reply[0] = REP_REPLY;
        reply[2..4].copy_from_slice(&1u16.to_le_bytes());
        reply[8] = 1;
        reply[9] = 139;
        server.write_all(&reply).unwrap();

        let mut got = [0u8; 32];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got[8], 1);
        assert_eq!(got[9], 139);
    }

    #[test]
    fn test_prohibited_extension_request_rejected_in_band() {
        let (mut client, mut server) =
            start_proxy(ExtensionTable::from_entries(&[("RENDER", 139)]));
        do_setup(&mut client, &mut server);

        // Request with an opcode the table does not know: length 2 units,
        // so a 4-byte body to drain.
        let mut req = [0u8; 8];
        req[0] = 200;
        req[2..4].copy_from_slice(&2u16.to_le_bytes());
        client.write_all(&req).unwrap();

        // The server receives a NoOperation in its place.
        let mut noop = [0u8; 4];
        server.read_exact(&mut noop).unwrap();
        assert_eq!(noop[0], OP_NO_OPERATION);
        assert_eq!(u16::from_le_bytes([noop[2], noop[3]]), 1);

        // The client receives a synthetic Error(Request).
        let mut err = [0u8; 32];
        client.read_exact(&mut err).unwrap();
        assert_eq!(err[0], REP_ERROR);
        assert_eq!(err[1], ERR_REQUEST);
        assert_eq!(u16::from_le_bytes([err[2], err[3]]), 1);
        assert_eq!(err[10], 200, "major opcode must name the rejected request");
    }

    #[test]
    fn test_sequence_numbers_count_rejected_requests() {
        let (mut client, mut server) =
            start_proxy(ExtensionTable::from_entries(&[("RENDER", 139)]));
        do_setup(&mut client, &mut server);

        // First request is rejected in-band (seq 1)...
        let mut req = [0u8; 4];
        req[0] = 210;
        req[2..4].copy_from_slice(&1u16.to_le_bytes());
        client.write_all(&req).unwrap();

        let mut noop = [0u8; 4];
        server.read_exact(&mut noop).unwrap();
        let mut err = [0u8; 32];
        client.read_exact(&mut err).unwrap();
        assert_eq!(u16::from_le_bytes([err[2], err[3]]), 1);

        // ...and a second rejected request carries seq 2.
        client.write_all(&req).unwrap();
        server.read_exact(&mut noop).unwrap();
        client.read_exact(&mut err).unwrap();
        assert_eq!(u16::from_le_bytes([err[2], err[3]]), 2);
    }

    #[test]
    fn test_big_requests_framing() {
        let (mut client, mut server) =
            start_proxy(ExtensionTable::from_entries(&[("RENDER", 139)]));
        do_setup(&mut client, &mut server);

        // Core opcode with 16-bit length 0 and 32-bit length 3: an 8-byte
        // header plus 4 bytes of body.
        let mut req = [0u8; 12];
        req[0] = 42;
        req[4..8].copy_from_slice(&3u32.to_le_bytes());
        req[8..12].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        client.write_all(&req).unwrap();

        let mut fwd = [0u8; 12];
        server.read_exact(&mut fwd).unwrap();
        assert_eq!(fwd, req);
    }

    #[test]
    fn test_events_pass_through_untouched() {
        let (mut client, mut server) =
            start_proxy(ExtensionTable::from_entries(&[("RENDER", 139)]));
        do_setup(&mut client, &mut server);

        // An Expose-style event: 32 bytes, no length field.
        let mut event = [0u8; 32];
        event[0] = 12;
        event[2..4].copy_from_slice(&7u16.to_le_bytes());
        server.write_all(&event).unwrap();

        let mut got = [0u8; 32];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, event);
    }

    #[test]
    fn test_setup_rejects_unknown_byte_order() {
        let (mut client, _server) =
            start_proxy(ExtensionTable::from_entries(&[("RENDER", 139)]));

        let mut hdr = [0u8; 12];
        hdr[0] = 0x55;
        client.write_all(&hdr).unwrap();

        // The proxy drops the connection without forwarding anything.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
