use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};

/// One classic BPF instruction on the wire.
const BPF_INSN_SIZE: usize = 8;

/// seccomp(2) rejects programs above this many instructions.
const MAX_BPF_INSNS: usize = 0xffff;

/// Compiles the textual policy language into a BPF filter program.  The
/// compiler itself is an external collaborator; the launcher only moves the
/// resulting bytes onto the helper's seccomp fd.
pub trait PolicyCompiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<Vec<u8>>;
}

/// Which policy a launch wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Browser,
    Tor { bridges: bool },
}

impl Profile {
    /// The policy source files for the profile, relative to the data
    /// directory.  Multiple sources concatenate into one program.
    fn sources(self) -> &'static [&'static str] {
        match self {
            Profile::Browser => &["torbrowser-amd64.seccomp"],
            Profile::Tor { bridges: false } => {
                &["tor-common-amd64.seccomp", "tor-amd64.seccomp"]
            }
            Profile::Tor { bridges: true } => {
                &["tor-common-amd64.seccomp", "tor-obfs4-amd64.seccomp"]
            }
        }
    }
}

/// Reads and combines the profile's rule sources, compiles them, and writes
/// the program to the helper's seccomp fd.
pub fn install(
    compiler: &dyn PolicyCompiler,
    data_dir: &Path,
    profile: Profile,
    fd: &mut dyn Write,
) -> Result<()> {
    let mut combined = String::new();
    for name in profile.sources() {
        let path: PathBuf = data_dir.join(name);
        let rules = fs::read_to_string(&path).map_err(|e| {
            Error::SandboxBuild(format!("missing seccomp rules {}: {e}", path.display()))
        })?;
        combined.push_str(&rules);
        combined.push('\n');
    }

    let bpf = compiler.compile(&combined)?;
    if bpf.len() % BPF_INSN_SIZE != 0 {
        return Err(Error::SandboxBuild(format!(
            "seccomp program is not a whole number of instructions ({} bytes)",
            bpf.len()
        )));
    }
    let insns = bpf.len() / BPF_INSN_SIZE;
    if insns > MAX_BPF_INSNS {
        return Err(Error::SandboxBuild(format!(
            "seccomp program too big: {insns} instructions (limit {MAX_BPF_INSNS})"
        )));
    }
    debug!("seccomp: installing {insns} instruction program ({profile:?})");

    fd.write_all(&bpf)?;
    Ok(())
}
