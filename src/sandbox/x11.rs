use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use nix::unistd::gethostname;

use crate::error::{Error, Result};

/// Where X11 display sockets live, on the host and in the sandbox.
pub const SOCK_DIR: &str = "/tmp/.X11-unix";

const FAMILY_AF_LOCAL: u16 = 256;

/// One record of an Xauthority file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRecord {
    pub family: u16,
    pub addr: Vec<u8>,
    pub display: Vec<u8>,
    pub method: Vec<u8>,
    pub data: Vec<u8>,
}

/// The host display, plus the synthetic authority the sandboxed browser
/// presents against the surrogate.
#[derive(Debug)]
pub struct SandboxedX11 {
    /// The DISPLAY value inside the sandbox; always the first display.
    pub display: &'static str,
    /// Path to the real display's socket.
    pub host_socket: PathBuf,
    /// Re-crafted Xauthority contents, when the host has a usable entry.
    pub xauthority: Option<Vec<u8>>,
    /// The cookie to present on the probe connection.
    pub auth: Option<AuthRecord>,
}

/// Resolves the host display (a local `:N` only) and crafts the sandbox
/// authority file.  A missing or unusable Xauthority degrades to no
/// authentication rather than failing the launch.
pub fn resolve(display_override: Option<&str>, sandbox_hostname: &str) -> Result<SandboxedX11> {
    let display = display_override
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .or_else(|| env::var("DISPLAY").ok().filter(|d| !d.is_empty()))
        .ok_or_else(|| Error::Config("no DISPLAY set".into()))?;

    if !display.starts_with(':') {
        return Err(Error::Config(format!(
            "non-local X11 display not supported: {display}"
        )));
    }

    // Multi-monitor setups use ":0.0" and similar; the display number is
    // the leading digits.
    let display_num: String = display[1..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if display_num.is_empty() {
        return Err(Error::Config(format!(
            "failed to determine X11 display from {display}"
        )));
    }

    let host_socket = Path::new(SOCK_DIR).join(format!("X{display_num}"));

    let (xauthority, auth) = match craft_authority(sandbox_hostname, &display_num) {
        Ok((bytes, record)) => (Some(bytes), Some(record)),
        Err(e) => {
            // Some systems run with no Xauthority at all.
            debug!("x11: no usable Xauthority: {e}");
            (None, None)
        }
    };

    Ok(SandboxedX11 {
        display: ":0",
        host_socket,
        xauthority,
        auth,
    })
}

/// Finds the host's AF_LOCAL authority entry for `display_num` and re-emits
/// it with the sandbox hostname and display `:0`.
fn craft_authority(sandbox_hostname: &str, display_num: &str) -> Result<(Vec<u8>, AuthRecord)> {
    let hostname = gethostname()
        .map_err(|e| Error::Config(format!("failed to read hostname: {e}")))?;
    let hostname = hostname.to_string_lossy().into_owned();

    let path = xauthority_path()?;
    let raw = fs::read(&path)?;

    for record in parse_authority(&raw)? {
        if record.family != FAMILY_AF_LOCAL
            || record.addr != hostname.as_bytes()
            || record.display != display_num.as_bytes()
        {
            continue;
        }

        let mut crafted = Vec::new();
        crafted.extend_from_slice(&record.family.to_be_bytes());
        encode_xstring(&mut crafted, sandbox_hostname.as_bytes());
        encode_xstring(&mut crafted, b"0");
        encode_xstring(&mut crafted, &record.method);
        encode_xstring(&mut crafted, &record.data);
        return Ok((crafted, record));
    }

    Err(Error::Config(format!(
        "no Xauthority entry for {hostname}:{display_num}"
    )))
}

fn xauthority_path() -> Result<PathBuf> {
    if let Ok(path) = env::var("XAUTHORITY") {
        if !path.is_empty() {
            if let Some(rest) = path.strip_prefix("~/") {
                let home = env::var("HOME")
                    .map_err(|_| Error::Config("XAUTHORITY is relative but HOME is unset".into()))?;
                return Ok(Path::new(&home).join(rest));
            }
            return Ok(PathBuf::from(path));
        }
    }
    let home = env::var("HOME").map_err(|_| Error::Config("HOME is unset".into()))?;
    Ok(Path::new(&home).join(".Xauthority"))
}

/// The file is a sequence of big-endian records:
/// `u16 family`, then four length-prefixed strings
/// (address, display, method, data).
pub(crate) fn parse_authority(mut raw: &[u8]) -> Result<Vec<AuthRecord>> {
    let mut records = Vec::new();

    while !raw.is_empty() {
        if raw.len() < 2 {
            break;
        }
        let family = u16::from_be_bytes([raw[0], raw[1]]);
        raw = &raw[2..];

        let mut take = || -> Result<Vec<u8>> {
            if raw.len() < 2 {
                return Err(Error::Config("truncated Xauthority entry".into()));
            }
            let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
            if raw.len() < 2 + len {
                return Err(Error::Config("truncated Xauthority string".into()));
            }
            let s = raw[2..2 + len].to_vec();
            raw = &raw[2 + len..];
            Ok(s)
        };

        records.push(AuthRecord {
            family,
            addr: take()?,
            display: take()?,
            method: take()?,
            data: take()?,
        });
    }
    Ok(records)
}

fn encode_xstring(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_bytes(family: u16, addr: &[u8], display: &[u8], method: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&family.to_be_bytes());
        for s in [addr, display, method, data] {
            encode_xstring(&mut out, s);
        }
        out
    }

    #[test]
    fn test_parse_authority() {
        let mut raw = record_bytes(0, b"10.0.0.1", b"0", b"MIT-MAGIC-COOKIE-1", b"abcd");
        raw.extend(record_bytes(
            FAMILY_AF_LOCAL,
            b"myhost",
            b"1",
            b"MIT-MAGIC-COOKIE-1",
            &[0xde, 0xad, 0xbe, 0xef],
        ));

        let records = parse_authority(&raw).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].family, FAMILY_AF_LOCAL);
        assert_eq!(records[1].addr, b"myhost");
        assert_eq!(records[1].display, b"1");
        assert_eq!(records[1].data, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_parse_authority_truncated() {
        let raw = record_bytes(FAMILY_AF_LOCAL, b"host", b"0", b"METH", b"data");
        assert!(parse_authority(&raw[..raw.len() - 2]).is_err());
    }

    #[test]
    fn test_crafted_record_layout() {
        // Re-encoding swaps the hostname and pins the display to 0.
        let mut crafted = Vec::new();
        crafted.extend_from_slice(&FAMILY_AF_LOCAL.to_be_bytes());
        encode_xstring(&mut crafted, b"amnesia");
        encode_xstring(&mut crafted, b"0");
        encode_xstring(&mut crafted, b"MIT-MAGIC-COOKIE-1");
        encode_xstring(&mut crafted, b"\x01\x02");

        let parsed = parse_authority(&crafted).unwrap();
        assert_eq!(
            parsed,
            vec![AuthRecord {
                family: FAMILY_AF_LOCAL,
                addr: b"amnesia".to_vec(),
                display: b"0".to_vec(),
                method: b"MIT-MAGIC-COOKIE-1".to_vec(),
                data: vec![1, 2],
            }]
        );
    }
}
