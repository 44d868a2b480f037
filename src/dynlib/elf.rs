use std::fs::{self, File};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use xmas_elf::ElfFile;
use xmas_elf::dynamic::Tag;
use xmas_elf::header::Class;
use xmas_elf::sections::SectionData;

use crate::error::{Error, Result};
use crate::utils;

use super::cache::LoaderCache;

/// Name and canonical search locations of the dynamic linker.
const LD_SO_NAME: &str = "ld-linux-x86-64.so.2";
const LD_SO_SEARCH: &[&str] = &["/lib64", "/lib"];

/// Reads object files on behalf of the cache and the resolver.  A trait so
/// tests can substitute a synthetic dependency graph for real ELF objects.
pub trait BinaryInspector {
    /// The DT_NEEDED entries of the object, in table order.
    fn imported_libraries(&self, path: &Path) -> Result<Vec<String>>;

    /// Errors unless the object's ELF class matches the host.
    fn verify_class(&self, path: &Path) -> Result<()>;
}

/// Production inspector: maps the file read-only and walks it with xmas-elf.
pub struct ElfInspector;

impl ElfInspector {
    fn with_object<T>(path: &Path, f: impl FnOnce(&ElfFile) -> Result<T>) -> Result<T> {
        let file = File::open(path)?;
        // SAFETY: the map is read-only and private to this call.
        let map = unsafe { Mmap::map(&file)? };
        let elf = ElfFile::new(&map).map_err(|reason| Error::MalformedObject {
            path: path.to_path_buf(),
            reason,
        })?;
        f(&elf)
    }
}

impl BinaryInspector for ElfInspector {
    fn imported_libraries(&self, path: &Path) -> Result<Vec<String>> {
        Self::with_object(path, |elf| {
            let malformed = |reason| Error::MalformedObject {
                path: path.to_path_buf(),
                reason,
            };

            let Some(dynamic) = elf.find_section_by_name(".dynamic") else {
                // Statically linked, no imports.
                return Ok(Vec::new());
            };
            let Some(dynstr) = elf.find_section_by_name(".dynstr") else {
                return Err(malformed("missing .dynstr"));
            };
            let strings = dynstr.raw_data(elf);

            let entries = match dynamic.get_data(elf).map_err(malformed)? {
                SectionData::Dynamic64(entries) => entries,
                _ => return Err(Error::UnsupportedClass(path.to_path_buf())),
            };

            let mut needed = Vec::new();
            for entry in entries {
                match entry.get_tag().map_err(malformed)? {
                    Tag::Needed => {
                        let off = entry.get_val().map_err(malformed)? as usize;
                        needed.push(read_strtab(strings, off).ok_or_else(|| {
                            malformed("DT_NEEDED offset out of .dynstr bounds")
                        })?);
                    }
                    Tag::Null => break,
                    _ => {}
                }
            }
            Ok(needed)
        })
    }

    fn verify_class(&self, path: &Path) -> Result<()> {
        Self::with_object(path, |elf| match elf.header.pt1.class() {
            Class::SixtyFour => Ok(()),
            _ => Err(Error::UnsupportedClass(path.to_path_buf())),
        })
    }
}

fn read_strtab(strings: &[u8], off: usize) -> Option<String> {
    if off >= strings.len() {
        return None;
    }
    let rest = &strings[off..];
    let len = rest.iter().position(|&b| b == 0)?;
    String::from_utf8(rest[..len].to_vec()).ok()
}

/// Locates the dynamic linker.  Returns the canonical path to the actual
/// object, and the absolute path executables expect it at.
pub fn find_ld_so(cache: &LoaderCache) -> Result<(PathBuf, PathBuf)> {
    for dir in LD_SO_SEARCH {
        let alias = Path::new(dir).join(LD_SO_NAME);
        if !utils::file_exists(&alias) {
            continue;
        }
        let Some(actual) = cache.lookup(LD_SO_NAME) else {
            continue;
        };
        let actual = fs::canonicalize(actual)?;
        return Ok((actual, alias));
    }
    Err(Error::UnresolvedLibrary(LD_SO_NAME.into()))
}

/// A minimal ELF64 header, enough for class validation in tests.
#[cfg(test)]
pub(crate) fn minimal_elf64() -> Vec<u8> {
    let mut hdr = vec![0u8; 64];
    hdr[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    hdr[4] = 2; // ELFCLASS64
    hdr[5] = 1; // little endian
    hdr[6] = 1; // EV_CURRENT
    hdr[16] = 3; // ET_DYN
    hdr[18] = 0x3e; // EM_X86_64
    hdr[20] = 1; // version
    hdr[52] = 64; // e_ehsize
    hdr
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_verify_class_rejects_elf32() {
        let dir = tempfile::tempdir().unwrap();

        let ok = dir.path().join("lib64.so");
        std::fs::File::create(&ok)
            .unwrap()
            .write_all(&minimal_elf64())
            .unwrap();
        assert!(ElfInspector.verify_class(&ok).is_ok());

        let mut elf32 = minimal_elf64();
        elf32[4] = 1; // ELFCLASS32
        let bad = dir.path().join("lib32.so");
        std::fs::File::create(&bad)
            .unwrap()
            .write_all(&elf32)
            .unwrap();
        assert!(matches!(
            ElfInspector.verify_class(&bad),
            Err(Error::UnsupportedClass(_))
        ));
    }

    #[test]
    fn test_not_an_elf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage");
        std::fs::write(&path, b"definitely not an object").unwrap();
        assert!(ElfInspector.verify_class(&path).is_err());
    }

    #[test]
    fn test_imported_libraries_of_host_linker() {
        // Any dynamically linked host binary will do; the test binary itself
        // imports at least libc or libgcc on every supported host.
        let exe = std::env::current_exe().unwrap();
        let libs = ElfInspector.imported_libraries(&exe).unwrap();
        assert!(!libs.is_empty());
        assert!(libs.iter().all(|l| !l.is_empty()));
    }
}
