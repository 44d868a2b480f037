use std::fs;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread;

use log::{debug, warn};
use rand::RngCore;

use crate::error::Result;
use crate::net::{Endpoint, Stream, copy_loop};
use crate::socks5::{self, ReplyCode};

/// Every password the surrogate re-dispatches carries this marker.
pub const TAG_PREFIX: &str = "sandboxed-tor-browser:";

/// The per-launch SOCKS isolation tag.  Rotating it makes the daemon build
/// fresh circuits for every subsequent request, and makes pre-existing
/// circuits invisible to the status filter.
pub struct IsolationTag(RwLock<String>);

impl IsolationTag {
    pub fn new() -> Self {
        let tag = IsolationTag(RwLock::new(String::new()));
        tag.rotate();
        tag
    }

    pub fn rotate(&self) {
        let mut entropy = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut entropy);
        *self.0.write().unwrap() = format!("{TAG_PREFIX}{}", hex::encode(entropy));
    }

    /// The suffix appended to isolation passwords, separator included.
    pub fn suffix(&self) -> String {
        format!(":{}", self.0.read().unwrap())
    }
}

impl Default for IsolationTag {
    fn default() -> Self {
        Self::new()
    }
}

/// The SOCKS5 surrogate: authenticates the browser, appends the isolation
/// tag to its credentials, and re-dispatches upstream.
pub struct SocksSurrogate {
    path: PathBuf,
    listener: UnixListener,
    upstream: Endpoint,
    tag: Arc<IsolationTag>,
}

impl SocksSurrogate {
    pub fn launch(path: &Path, upstream: Endpoint, tag: Arc<IsolationTag>) -> Result<Arc<Self>> {
        let _ = fs::remove_file(path);
        let listener = UnixListener::bind(path)?;

        let surrogate = Arc::new(SocksSurrogate {
            path: path.to_path_buf(),
            listener,
            upstream,
            tag,
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
        // Wakes the accept loop with an error.
        unsafe {
            libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
        }
    }

    fn accept_loop(self: Arc<Self>) {
        loop {
            match self.listener.accept() {
                Ok((conn, _)) => {
                    let worker = self.clone();
                    thread::spawn(move || worker.handle_conn(conn));
                }
                Err(e) => {
                    debug!("socks: accept loop exiting: {e}");
                    return;
                }
            }
        }
    }

    fn handle_conn(&self, mut conn: UnixStream) {
        let mut req = match socks5::handshake(&mut conn) {
            Ok(req) => req,
            Err(e) => {
                debug!("socks: handshake failed: {e}");
                return;
            }
        };

        if let Err(code) = self.rewrite_tag(&mut req) {
            let _ = socks5::send_reply(&mut conn, code);
            return;
        }

        let upstream = match socks5::redispatch(&self.upstream, &req) {
            Ok(stream) => stream,
            Err(e) => {
                debug!("socks: redispatch to {} failed: {e}", req.addr);
                let _ = socks5::send_reply(&mut conn, e.reply_code());
                return;
            }
        };

        if socks5::send_reply(&mut conn, ReplyCode::Succeeded).is_err() {
            return;
        }
        copy_loop(upstream, Stream::Unix(conn));
    }

    fn rewrite_tag(&self, req: &mut socks5::Request) -> Result<(), ReplyCode> {
        // A request without username/password isolation is an upstream bug
        // to surface, not to paper over.
        if req.auth.uname.is_empty() {
            warn!("socks: request without isolation credentials");
            return Err(ReplyCode::GeneralFailure);
        }
        req.auth.passwd.extend_from_slice(self.tag.suffix().as_bytes());
        // With the current tag format this cannot happen.
        if req.auth.passwd.len() > 255 {
            warn!("socks: rewritten password over 255 bytes");
            return Err(ReplyCode::GeneralFailure);
        }
        Ok(())
    }
}

/// A dumb TCP-to-upstream relay, so host tools outside the sandbox can still
/// reach the daemon's SOCKS port at the address they expect.
pub struct PassthroughProxy {
    listener: TcpListener,
    upstream: Endpoint,
}

impl PassthroughProxy {
    pub fn launch(addr: &str, upstream: Endpoint) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr)?;
        let proxy = Arc::new(PassthroughProxy { listener, upstream });

        let accept = proxy.clone();
        thread::spawn(move || accept.accept_loop());
        Ok(proxy)
    }

    pub fn close(&self) {
        unsafe {
            libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
        }
    }

    fn accept_loop(self: Arc<Self>) {
        loop {
            match self.listener.accept() {
                Ok((conn, _)) => {
                    let upstream = self.upstream.clone();
                    thread::spawn(move || {
                        let Ok(up) = upstream.connect() else {
                            return;
                        };
                        copy_loop(up, Stream::Tcp(conn));
                    });
                }
                Err(e) => {
                    debug!("socks: passthrough accept loop exiting: {e}");
                    return;
                }
            }
        }
    }
}
