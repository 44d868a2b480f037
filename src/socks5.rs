//! Just enough SOCKS5 (RFC 1928) to interpose between the browser and the
//! daemon: a server-side handshake that captures RFC 1929 credentials, and a
//! client-side redispatcher that replays a captured request upstream.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::net::{Endpoint, Stream};

const VERSION: u8 = 0x05;

const AUTH_USERNAME_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xff;

const AUTH_RFC1929_VERSION: u8 = 0x01;
const AUTH_RFC1929_SUCCESS: u8 = 0x00;
const AUTH_RFC1929_FAIL: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressNotSupported = 0x08,
}

impl ReplyCode {
    fn from_wire(b: u8) -> ReplyCode {
        match b {
            0x00 => ReplyCode::Succeeded,
            0x02 => ReplyCode::ConnectionNotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressNotSupported,
            _ => ReplyCode::GeneralFailure,
        }
    }
}

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("socks5: upstream replied {0:?}")]
    Reply(ReplyCode),
    #[error("socks5: {0}")]
    Protocol(&'static str),
    #[error("socks5: {0}")]
    Io(#[from] io::Error),
}

impl SocksError {
    /// The reply code to relay to the application for this failure.
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            SocksError::Reply(code) => *code,
            _ => ReplyCode::GeneralFailure,
        }
    }
}

pub type SocksResult<T> = Result<T, SocksError>;

/// RFC 1929 credentials, captured verbatim.
#[derive(Debug, Clone, Default)]
pub struct AuthInfo {
    pub uname: Vec<u8>,
    pub passwd: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr, u16),
    Domain(String, u16),
    Ipv6(Ipv6Addr, u16),
}

impl Address {
    fn read_from<S: Read>(conn: &mut S) -> SocksResult<Address> {
        let atyp = read_byte(conn)?;
        let addr = match atyp {
            ATYP_IPV4 => {
                let mut a = [0u8; 4];
                conn.read_exact(&mut a)?;
                Address::Ipv4(Ipv4Addr::from(a), read_port(conn)?)
            }
            ATYP_DOMAIN => {
                let len = read_byte(conn)? as usize;
                let mut name = vec![0u8; len];
                conn.read_exact(&mut name)?;
                let name = String::from_utf8(name)
                    .map_err(|_| SocksError::Protocol("domain is not valid UTF-8"))?;
                Address::Domain(name, read_port(conn)?)
            }
            ATYP_IPV6 => {
                let mut a = [0u8; 16];
                conn.read_exact(&mut a)?;
                Address::Ipv6(Ipv6Addr::from(a), read_port(conn)?)
            }
            _ => return Err(SocksError::Protocol("unsupported address type")),
        };
        Ok(addr)
    }

    fn write_to<S: Write>(&self, conn: &mut S) -> SocksResult<()> {
        match self {
            Address::Ipv4(a, port) => {
                conn.write_all(&[ATYP_IPV4])?;
                conn.write_all(&a.octets())?;
                conn.write_all(&port.to_be_bytes())?;
            }
            Address::Domain(name, port) => {
                if name.len() > 255 {
                    return Err(SocksError::Protocol("domain name too long"));
                }
                conn.write_all(&[ATYP_DOMAIN, name.len() as u8])?;
                conn.write_all(name.as_bytes())?;
                conn.write_all(&port.to_be_bytes())?;
            }
            Address::Ipv6(a, port) => {
                conn.write_all(&[ATYP_IPV6])?;
                conn.write_all(&a.octets())?;
                conn.write_all(&port.to_be_bytes())?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(a, port) => write!(f, "{a}:{port}"),
            Address::Domain(name, port) => write!(f, "{name}:{port}"),
            Address::Ipv6(a, port) => write!(f, "[{a}]:{port}"),
        }
    }
}

/// A parsed client request, held apart from the connection it arrived on.
#[derive(Debug, Clone)]
pub struct Request {
    pub auth: AuthInfo,
    pub addr: Address,
}

/// Runs the server side of the SOCKS5 chatter up to (and including) the
/// request.  Only username/password authentication and CONNECT survive;
/// everything else is answered on the wire and returned as an error.
pub fn handshake<S: Read + Write>(conn: &mut S) -> SocksResult<Request> {
    negotiate_auth_method(conn)?;
    let auth = read_auth(conn)?;

    // VER CMD RSV ATYP ...
    if read_byte(conn)? != VERSION {
        return Err(SocksError::Protocol("bad request version"));
    }
    let cmd = read_byte(conn)?;
    let _rsv = read_byte(conn)?;
    if cmd != CMD_CONNECT {
        send_reply(conn, ReplyCode::CommandNotSupported)?;
        return Err(SocksError::Reply(ReplyCode::CommandNotSupported));
    }
    let addr = Address::read_from(conn)?;

    Ok(Request { auth, addr })
}

fn negotiate_auth_method<S: Read + Write>(conn: &mut S) -> SocksResult<()> {
    if read_byte(conn)? != VERSION {
        return Err(SocksError::Protocol("bad greeting version"));
    }
    let nmethods = read_byte(conn)? as usize;
    let mut methods = vec![0u8; nmethods];
    conn.read_exact(&mut methods)?;

    if !methods.contains(&AUTH_USERNAME_PASSWORD) {
        conn.write_all(&[VERSION, AUTH_NO_ACCEPTABLE])?;
        return Err(SocksError::Protocol(
            "client does not offer username/password auth",
        ));
    }
    conn.write_all(&[VERSION, AUTH_USERNAME_PASSWORD])?;
    Ok(())
}

/// RFC 1929 sub-negotiation.  The fields are captured as-is; deciding what
/// an empty username means is the caller's policy, not the parser's.
fn read_auth<S: Read + Write>(conn: &mut S) -> SocksResult<AuthInfo> {
    let fail = |conn: &mut S| {
        // Best effort; the auth failure is the interesting error.
        let _ = conn.write_all(&[AUTH_RFC1929_VERSION, AUTH_RFC1929_FAIL]);
    };

    if read_byte(conn)? != AUTH_RFC1929_VERSION {
        fail(conn);
        return Err(SocksError::Protocol("bad auth sub-negotiation version"));
    }

    let ulen = read_byte(conn)? as usize;
    let mut uname = vec![0u8; ulen];
    conn.read_exact(&mut uname)?;

    let plen = read_byte(conn)? as usize;
    let mut passwd = vec![0u8; plen];
    conn.read_exact(&mut passwd)?;

    conn.write_all(&[AUTH_RFC1929_VERSION, AUTH_RFC1929_SUCCESS])?;
    Ok(AuthInfo { uname, passwd })
}

/// Answers the request with the given code and an all-zero IPv4 bind
/// address.
pub fn send_reply<S: Write>(conn: &mut S, code: ReplyCode) -> SocksResult<()> {
    let mut reply = [0u8; 10];
    reply[0] = VERSION;
    reply[1] = code as u8;
    reply[3] = ATYP_IPV4;
    conn.write_all(&reply)?;
    Ok(())
}

/// Dials the proxy at `endpoint` and replays `req` with its (possibly
/// rewritten) credentials.  On success the returned stream is the connected
/// tunnel.
pub fn redispatch(endpoint: &Endpoint, req: &Request) -> SocksResult<Stream> {
    let mut conn = endpoint.connect()?;
    redispatch_on(&mut conn, req)?;
    Ok(conn)
}

fn redispatch_on(mut conn: &mut Stream, req: &Request) -> SocksResult<()> {
    conn.write_all(&[VERSION, 1, AUTH_USERNAME_PASSWORD])?;
    let mut resp = [0u8; 2];
    conn.read_exact(&mut resp)?;
    if resp != [VERSION, AUTH_USERNAME_PASSWORD] {
        return Err(SocksError::Protocol("proxy refused username/password auth"));
    }

    if req.auth.uname.len() > 255 || req.auth.passwd.len() > 255 {
        return Err(SocksError::Protocol("credentials too long"));
    }
    let mut auth = Vec::with_capacity(3 + req.auth.uname.len() + req.auth.passwd.len());
    auth.push(AUTH_RFC1929_VERSION);
    auth.push(req.auth.uname.len() as u8);
    auth.extend_from_slice(&req.auth.uname);
    auth.push(req.auth.passwd.len() as u8);
    auth.extend_from_slice(&req.auth.passwd);
    conn.write_all(&auth)?;
    conn.read_exact(&mut resp)?;
    if resp[1] != AUTH_RFC1929_SUCCESS {
        return Err(SocksError::Protocol("proxy rejected credentials"));
    }

    conn.write_all(&[VERSION, CMD_CONNECT, 0x00])?;
    req.addr.write_to(&mut conn)?;

    if read_byte(&mut conn)? != VERSION {
        return Err(SocksError::Protocol("bad reply version"));
    }
    let code = ReplyCode::from_wire(read_byte(conn)?);
    let _rsv = read_byte(conn)?;
    let _bind = Address::read_from(conn)?;
    if code != ReplyCode::Succeeded {
        return Err(SocksError::Reply(code));
    }

    Ok(())
}

fn read_byte<S: Read>(conn: &mut S) -> io::Result<u8> {
    let mut b = [0u8; 1];
    conn.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_port<S: Read>(conn: &mut S) -> io::Result<u16> {
    let mut b = [0u8; 2];
    conn.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn drive_client(mut conn: UnixStream, bytes: &'static [u8]) -> thread::JoinHandle<Vec<u8>> {
        thread::spawn(move || {
            conn.write_all(bytes).unwrap();
            let mut out = Vec::new();
            let _ = conn.read_to_end(&mut out);
            out
        })
    }

    #[test]
    fn test_handshake_captures_credentials() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let jh = drive_client(
            client,
            &[
                0x05, 0x01, 0x02, // greeting: user/pass only
                0x01, 0x01, b'x', 0x01, b'y', // auth: "x" / "y"
                0x05, 0x01, 0x00, 0x03, 0x0b, b'e', b'x', b'a', b'm', b'p', b'l', b'e',
                b'.', b'c', b'o', b'm', 0x00, 0x50, // CONNECT example.com:80
            ],
        );

        let req = handshake(&mut server).unwrap();
        assert_eq!(req.auth.uname, b"x");
        assert_eq!(req.auth.passwd, b"y");
        assert_eq!(req.addr, Address::Domain("example.com".into(), 80));
        drop(server);

        let responses = jh.join().unwrap();
        assert_eq!(&responses[..4], &[0x05, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_handshake_rejects_no_auth() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let jh = drive_client(client, &[0x05, 0x01, 0x00]);

        assert!(handshake(&mut server).is_err());
        drop(server);
        assert_eq!(jh.join().unwrap(), vec![0x05, 0xff]);
    }

    #[test]
    fn test_handshake_rejects_bind() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let jh = drive_client(
            client,
            &[
                0x05, 0x01, 0x02, //
                0x01, 0x01, b'u', 0x01, b'p', //
                0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50, // BIND
            ],
        );

        let err = handshake(&mut server).unwrap_err();
        assert_eq!(err.reply_code(), ReplyCode::CommandNotSupported);
        drop(server);

        let responses = jh.join().unwrap();
        let reply = &responses[4..];
        assert_eq!(reply[1], ReplyCode::CommandNotSupported as u8);
    }

    #[test]
    fn test_redispatch_carries_rewritten_password() {
        let (upstream, proxy_side) = UnixStream::pair().unwrap();

        let server = thread::spawn(move || {
            let mut conn = proxy_side;
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x02]);
            conn.write_all(&[0x05, 0x02]).unwrap();

            assert_eq!(read_byte(&mut conn).unwrap(), 0x01);
            let ulen = read_byte(&mut conn).unwrap() as usize;
            let mut uname = vec![0u8; ulen];
            conn.read_exact(&mut uname).unwrap();
            let plen = read_byte(&mut conn).unwrap() as usize;
            let mut passwd = vec![0u8; plen];
            conn.read_exact(&mut passwd).unwrap();
            conn.write_all(&[0x01, 0x00]).unwrap();

            let mut req_hdr = [0u8; 3];
            conn.read_exact(&mut req_hdr).unwrap();
            let addr = Address::read_from(&mut conn).unwrap();
            conn.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .unwrap();
            (uname, passwd, addr)
        });

        let req = Request {
            auth: AuthInfo {
                uname: b"x".to_vec(),
                passwd: b"y:tag".to_vec(),
            },
            addr: Address::Domain("example.com".into(), 80),
        };
        let mut conn = Stream::Unix(upstream);
        redispatch_on(&mut conn, &req).unwrap();

        let (uname, passwd, addr) = server.join().unwrap();
        assert_eq!(uname, b"x");
        assert_eq!(passwd, b"y:tag");
        assert_eq!(addr, Address::Domain("example.com".into(), 80));
    }
}
