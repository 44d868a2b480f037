//! Interrogation of the glibc dynamic linker: the `ld.so.cache` index, ELF
//! import tables, and transitive library closures for sandboxed binaries.

mod cache;
mod elf;
mod resolver;

pub use cache::{LD_SO_CACHE, CacheEntry, LoaderCache};
pub use elf::{BinaryInspector, ElfInspector, find_ld_so};
pub use resolver::{FilterFn, LibraryClosure, resolve_libraries};

/// Restricting the sandbox to a computed library closure only works on
/// 64-bit Linux.
pub fn is_supported() -> bool {
    cfg!(all(target_os = "linux", target_arch = "x86_64"))
}
