use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::Mmap;
use nix::sys::utsname::uname;

use crate::error::{Error, Result};

use super::elf::BinaryInspector;

pub const LD_SO_CACHE: &str = "/etc/ld.so.cache";

const MAGIC_OLD: &[u8] = b"ld.so-1.7.0\0";
const MAGIC_NEW: &[u8] = b"glibc-ld.so.cache1.1";

const OLD_ENTRY_SIZE: usize = 4 + 4 + 4;
const NEW_ENTRY_SIZE: usize = 4 + 4 + 4 + 4 + 8;
const NEW_HEADER_SIZE: usize = MAGIC_NEW.len() + 4 + 4 + 20;

const FLAG_ELF_LIBC6: u32 = 3;
const FLAG_X8664_LIB64: u32 = 0x0300;

/// One accepted `ld.so.cache` record.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: PathBuf,
    pub flags: u32,
    pub os_version: u32,
    pub hwcap: u64,
}

/// In-memory index of the host dynamic linker cache.  Built once per launch,
/// read-only afterwards.
#[derive(Debug, Default)]
pub struct LoaderCache {
    store: HashMap<String, Vec<CacheEntry>>,
}

impl LoaderCache {
    /// Loads and parses `/etc/ld.so.cache`, keeping only entries usable on
    /// this host.
    pub fn load(path: &Path, inspector: &dyn BinaryInspector) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: read-only private map of a file the loader itself maps.
        let map = unsafe { Mmap::map(&file)? };
        Self::parse(&map, host_os_version(), inspector)
    }

    /// Highest ranked path for the SONAME, if any.  Makes no attempt to
    /// disambiguate beyond the load-time (hwcap, os_version) ordering.
    pub fn lookup(&self, name: &str) -> Option<&Path> {
        self.store
            .get(name)
            .and_then(|ents| ents.first())
            .map(|e| e.value.as_path())
    }

    /// All retained entries for the SONAME, ranking order.
    pub fn entries(&self, name: &str) -> &[CacheEntry] {
        self.store.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_tests(&mut self, key: &str, value: &Path) {
        self.store.entry(key.to_string()).or_default().push(CacheEntry {
            key: key.to_string(),
            value: value.to_path_buf(),
            flags: FLAG_X8664_LIB64 | FLAG_ELF_LIBC6,
            os_version: 0,
            hwcap: 0,
        });
    }

    fn parse(raw: &[u8], host_version: u32, inspector: &dyn BinaryInspector) -> Result<Self> {
        debug!("dynlib: host os version: {host_version:08x}");

        let body = skip_legacy_format(raw)?;

        if !body.starts_with(MAGIC_NEW) {
            return Err(Error::MalformedCache("bad new-format magic"));
        }
        let nlibs = read_u32(body, MAGIC_NEW.len())? as usize;
        let len_strings = read_u32(body, MAGIC_NEW.len() + 4)? as usize;

        let entries_end = NEW_HEADER_SIZE
            .checked_add(nlibs.checked_mul(NEW_ENTRY_SIZE).ok_or(Error::MalformedCache(
                "entry count overflow",
            ))?)
            .ok_or(Error::MalformedCache("entry count overflow"))?;
        if body.len() < entries_end {
            return Err(Error::MalformedCache("truncated entry table"));
        }
        if body.len() - entries_end != len_strings {
            return Err(Error::MalformedCache("string table length mismatch"));
        }

        let mut cache = LoaderCache::default();
        for i in 0..nlibs {
            let off = NEW_HEADER_SIZE + i * NEW_ENTRY_SIZE;
            let entry = CacheEntry {
                flags: read_u32(body, off)?,
                key: read_string(body, read_u32(body, off + 4)? as usize)?,
                value: PathBuf::from(read_string(body, read_u32(body, off + 8)? as usize)?),
                os_version: read_u32(body, off + 12)?,
                hwcap: read_u64(body, off + 16)?,
            };

            // Discard entries there is no hope of using.
            if entry.os_version > host_version {
                debug!(
                    "dynlib: ignoring {} (os_version {:08x})",
                    entry.key, entry.os_version
                );
            } else if !flags_match_host(entry.flags) {
                debug!(
                    "dynlib: ignoring {} (flags {:04x}, hwcap {:x})",
                    entry.key, entry.flags, entry.hwcap
                );
            } else if let Err(e) = inspector.verify_class(&entry.value) {
                debug!("dynlib: ignoring {} ({e})", entry.key);
            } else {
                cache.store.entry(entry.key.clone()).or_default().push(entry);
            }
        }

        // Rank multiple entries per SONAME the way ld-linux.so would prefer
        // them; the stable sort preserves discovery order on ties.
        for entries in cache.store.values_mut() {
            if entries.len() > 1 {
                entries.sort_by(|a, b| {
                    b.hwcap
                        .cmp(&a.hwcap)
                        .then(b.os_version.cmp(&a.os_version))
                });
                debug!(
                    "dynlib: multiple entries for {}: {:?}",
                    entries[0].key,
                    entries.iter().map(|e| &e.value).collect::<Vec<_>>()
                );
            }
        }

        Ok(cache)
    }
}

/// The legacy format prefixes the file; the new format body follows it,
/// 8-byte aligned.
fn skip_legacy_format(raw: &[u8]) -> Result<&[u8]> {
    if !raw.starts_with(MAGIC_OLD) {
        return Err(Error::MalformedCache("bad legacy magic"));
    }
    let mut off = MAGIC_OLD.len();

    let nlibs = read_u32(raw, off)? as usize;
    off += 4;

    let table_len = nlibs
        .checked_mul(OLD_ENTRY_SIZE)
        .ok_or(Error::MalformedCache("legacy entry count overflow"))?;
    off = off
        .checked_add(table_len)
        .ok_or(Error::MalformedCache("legacy entry count overflow"))?;
    if raw.len() < off {
        return Err(Error::MalformedCache("truncated legacy entry table"));
    }

    off = (off + 7) & !7;
    if raw.len() < off {
        return Err(Error::MalformedCache("truncated alignment padding"));
    }
    Ok(&raw[off..])
}

fn flags_match_host(flags: u32) -> bool {
    const WANT: u32 = FLAG_X8664_LIB64 | FLAG_ELF_LIBC6;
    flags & WANT == WANT
}

fn read_u32(b: &[u8], off: usize) -> Result<u32> {
    let end = off.checked_add(4).ok_or(Error::MalformedCache("offset overflow"))?;
    if b.len() < end {
        return Err(Error::MalformedCache("truncated header"));
    }
    Ok(u32::from_le_bytes(b[off..end].try_into().unwrap()))
}

fn read_u64(b: &[u8], off: usize) -> Result<u64> {
    let end = off.checked_add(8).ok_or(Error::MalformedCache("offset overflow"))?;
    if b.len() < end {
        return Err(Error::MalformedCache("truncated header"));
    }
    Ok(u64::from_le_bytes(b[off..end].try_into().unwrap()))
}

/// String table offsets index from the start of the new-format region.
fn read_string(body: &[u8], off: usize) -> Result<String> {
    if off >= body.len() {
        return Err(Error::MalformedCache("string offset out of bounds"));
    }
    let rest = &body[off..];
    let len = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::MalformedCache("unterminated string"))?;
    String::from_utf8(rest[..len].to_vec())
        .map_err(|_| Error::MalformedCache("string table encoding"))
}

/// Packs up to three dotted decimal components of `uname -r` into a u32,
/// high byte first, unspecified components zero.  glibc does not cope with
/// components above 255 either.
pub fn host_os_version() -> u32 {
    let uts = match uname() {
        Ok(uts) => uts,
        Err(_) => return 0,
    };
    let release = uts.release().to_string_lossy();
    pack_os_version(&release)
}

fn pack_os_version(release: &str) -> u32 {
    let digits: String = release
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let mut packed = 0u32;
    let mut appended = 0u32;
    for part in digits.split('.').take(3) {
        let mut sub = 0u8;
        for b in part.bytes() {
            sub = sub.wrapping_mul(10).wrapping_add(b - b'0');
        }
        packed = (packed << 8) | u32::from(sub);
        appended += 1;
    }
    packed << (8 * (3 - appended))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    struct AcceptAll;
    impl BinaryInspector for AcceptAll {
        fn imported_libraries(&self, _: &Path) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn verify_class(&self, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct HostClassOnly;
    impl BinaryInspector for HostClassOnly {
        fn imported_libraries(&self, _: &Path) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn verify_class(&self, path: &Path) -> Result<()> {
            super::super::elf::ElfInspector.verify_class(path)
        }
    }

    struct RawEntry<'a> {
        key: &'a str,
        value: &'a str,
        flags: u32,
        os_version: u32,
        hwcap: u64,
    }

    fn build_cache(entries: &[RawEntry]) -> Vec<u8> {
        let mut buf = Vec::new();

        // Legacy prefix with no entries.
        buf.extend_from_slice(MAGIC_OLD);
        buf.extend_from_slice(&0u32.to_le_bytes());
        while buf.len() % 8 != 0 {
            buf.push(0);
        }

        // String table layout first, so records can carry offsets.
        let mut strings = Vec::new();
        let mut offsets = Vec::new();
        for e in entries {
            let base = NEW_HEADER_SIZE + entries.len() * NEW_ENTRY_SIZE;
            let k = base + strings.len();
            strings.extend_from_slice(e.key.as_bytes());
            strings.push(0);
            let v = base + strings.len();
            strings.extend_from_slice(e.value.as_bytes());
            strings.push(0);
            offsets.push((k as u32, v as u32));
        }

        buf.extend_from_slice(MAGIC_NEW);
        buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(strings.len() as u32).to_le_bytes());
        buf.extend_from_slice(&[0u8; 20]);
        for (e, (k, v)) in entries.iter().zip(&offsets) {
            buf.extend_from_slice(&e.flags.to_le_bytes());
            buf.extend_from_slice(&k.to_le_bytes());
            buf.extend_from_slice(&v.to_le_bytes());
            buf.extend_from_slice(&e.os_version.to_le_bytes());
            buf.extend_from_slice(&e.hwcap.to_le_bytes());
        }
        buf.extend_from_slice(&strings);
        buf
    }

    const HOST: u32 = 0x0004_0900; // "4.9"

    #[test]
    fn test_pack_os_version() {
        assert_eq!(pack_os_version("4.9.11"), 0x0004_090b);
        assert_eq!(pack_os_version("4.9"), 0x0004_0900);
        assert_eq!(pack_os_version("6"), 0x0006_0000);
        assert_eq!(pack_os_version("5.10.0-21-amd64"), 0x0005_0a00);
        assert_eq!(pack_os_version("6.1.38-generic"), 0x0006_0126);
    }

    #[test]
    fn test_parse_and_rank() {
        let lib64 = FLAG_X8664_LIB64 | FLAG_ELF_LIBC6;
        let raw = build_cache(&[
            RawEntry {
                key: "libc.so.6",
                value: "/lib/libc-plain.so",
                flags: lib64,
                os_version: 0,
                hwcap: 0,
            },
            RawEntry {
                key: "libc.so.6",
                value: "/lib/libc-hwcap.so",
                flags: lib64,
                os_version: 0,
                hwcap: 1,
            },
            RawEntry {
                key: "libfuture.so.1",
                value: "/lib/libfuture.so.1",
                flags: lib64,
                os_version: 0x7f00_0000,
                hwcap: 0,
            },
            RawEntry {
                key: "lib32.so.1",
                value: "/lib32/lib32.so.1",
                flags: FLAG_ELF_LIBC6,
                os_version: 0,
                hwcap: 0,
            },
        ]);

        let cache = LoaderCache::parse(&raw, HOST, &AcceptAll).unwrap();
        assert_eq!(cache.len(), 1);

        // Higher hwcap ranks first, and the effective entries survive the
        // round trip through parsing intact.
        let ents = cache.entries("libc.so.6");
        assert_eq!(ents.len(), 2);
        assert_eq!(ents[0].value, PathBuf::from("/lib/libc-hwcap.so"));
        assert_eq!(ents[0].hwcap, 1);
        assert_eq!(ents[1].value, PathBuf::from("/lib/libc-plain.so"));
        assert!(ents.windows(2).all(|w| {
            (w[0].hwcap, w[0].os_version) >= (w[1].hwcap, w[1].os_version)
        }));

        assert_eq!(
            cache.lookup("libc.so.6"),
            Some(Path::new("/lib/libc-hwcap.so"))
        );
        assert!(cache.lookup("libfuture.so.1").is_none());
        assert!(cache.lookup("lib32.so.1").is_none());
    }

    #[test]
    fn test_class_validation_drops_entries() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("libgood.so.1");
        std::fs::File::create(&good)
            .unwrap()
            .write_all(&super::super::elf::minimal_elf64())
            .unwrap();

        let good_s = good.to_str().unwrap();
        let lib64 = FLAG_X8664_LIB64 | FLAG_ELF_LIBC6;
        let raw = build_cache(&[
            RawEntry {
                key: "libgood.so.1",
                value: good_s,
                flags: lib64,
                os_version: 0,
                hwcap: 0,
            },
            RawEntry {
                key: "libmissing.so.1",
                value: "/nonexistent/libmissing.so.1",
                flags: lib64,
                os_version: 0,
                hwcap: 0,
            },
        ]);

        let cache = LoaderCache::parse(&raw, HOST, &HostClassOnly).unwrap();
        assert!(cache.lookup("libgood.so.1").is_some());
        assert!(cache.lookup("libmissing.so.1").is_none());
    }

    #[test]
    fn test_malformed() {
        let lib64 = FLAG_X8664_LIB64 | FLAG_ELF_LIBC6;
        let good = build_cache(&[RawEntry {
            key: "libc.so.6",
            value: "/lib/libc.so.6",
            flags: lib64,
            os_version: 0,
            hwcap: 0,
        }]);

        // Bad legacy magic.
        let mut bad = good.clone();
        bad[0] ^= 0xff;
        assert!(matches!(
            LoaderCache::parse(&bad, HOST, &AcceptAll),
            Err(Error::MalformedCache("bad legacy magic"))
        ));

        // Bad new-format magic.
        let mut bad = good.clone();
        bad[16] ^= 0xff;
        assert!(matches!(
            LoaderCache::parse(&bad, HOST, &AcceptAll),
            Err(Error::MalformedCache("bad new-format magic"))
        ));

        // Every possible truncation.
        for len in 0..good.len() {
            assert!(
                LoaderCache::parse(&good[..len], HOST, &AcceptAll).is_err(),
                "truncation to {len} bytes parsed"
            );
        }
    }
}
