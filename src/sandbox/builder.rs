use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use nix::fcntl::OFlag;
use nix::unistd::{getgid, getuid, pipe2};
use serde::Deserialize;

use crate::dynlib::LibraryClosure;
use crate::error::{Error, Result};
use crate::utils;

use super::process::Process;

/// Where closure libraries land inside the sandbox.
pub const RESTRICTED_LIB_DIR: &str = "/usr/lib";

const DEFAULT_HELPER_PATH: &str = "/usr/bin/bwrap";
const DEFAULT_HOSTNAME: &str = "amnesia";
const DEFAULT_HOME: &str = "/home/amnesia";

/// The fd carrying the NUL-separated argument buffer; injected files follow.
const ARGS_FD: usize = 3;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

pub type SeccompFn = Box<dyn FnOnce(&mut dyn Write) -> Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HelperVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl HelperVersion {
    fn parse(output: &str) -> Result<Self> {
        let vers = output
            .trim()
            .strip_prefix("bubblewrap")
            .ok_or_else(|| Error::SandboxBuild(format!("unrecognized helper version: {output:?}")))?
            .trim();

        let mut parts = vers.split('.').map(|p| {
            p.parse::<u32>()
                .map_err(|_| Error::SandboxBuild(format!("unparseable helper version: {vers:?}")))
        });
        let mut next = || {
            parts
                .next()
                .unwrap_or_else(|| Err(Error::SandboxBuild(format!("short helper version: {vers:?}"))))
        };
        Ok(HelperVersion {
            major: next()?,
            minor: next()?,
            patch: next()?,
        })
    }

    pub fn at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }
}

impl std::fmt::Display for HelperVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn query_helper_version(helper: &Path) -> Result<HelperVersion> {
    let out = Command::new(helper)
        .arg("--version")
        .env_clear()
        .output()
        .map_err(|e| Error::SandboxBuild(format!("failed to run {}: {e}", helper.display())))?;
    if !out.status.success() {
        return Err(Error::SandboxBuild(format!(
            "helper version query failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    HelperVersion::parse(&String::from_utf8_lossy(&out.stdout))
}

#[derive(Debug, Clone, Copy)]
pub struct UnshareOpts {
    pub user: bool,
    pub ipc: bool,
    pub pid: bool,
    pub net: bool,
    pub uts: bool,
    pub cgroup: bool,
}

impl UnshareOpts {
    fn to_args(self) -> Result<Vec<OsString>> {
        // Killing the namespace init is the only reliable cleanup, so a pid
        // namespace is not negotiable.
        if !self.pid {
            return Err(Error::SandboxBuild("a pid namespace is mandatory".into()));
        }

        let mut args: Vec<OsString> = vec!["--unshare-pid".into()];
        if self.user {
            args.push("--unshare-user".into());
        }
        if self.ipc {
            args.push("--unshare-ipc".into());
        }
        if self.net {
            args.push("--unshare-net".into());
        }
        if self.uts {
            args.push("--unshare-uts".into());
        }
        if self.cgroup {
            args.push("--unshare-cgroup-try".into());
        }
        Ok(args)
    }
}

#[derive(Deserialize)]
struct HelperInfo {
    #[serde(rename = "child-pid")]
    child_pid: i32,
}

/// Accumulates mount/env/namespace directives, then drives the helper binary
/// that performs the privileged setup, passing everything over numbered
/// pipes: the argument buffer on fd 3, injected file contents on the fds
/// after it, optionally a seccomp program, and finally an info fd the helper
/// answers on with the in-namespace init pid.
pub struct SandboxBuilder {
    pub(crate) cmd: PathBuf,
    pub(crate) cmd_args: Vec<OsString>,

    pub(crate) hostname: String,
    pub(crate) home_dir: PathBuf,
    pub(crate) runtime_dir: PathBuf,
    pub(crate) chdir: Option<PathBuf>,
    pub(crate) mount_proc: bool,
    pub(crate) fake_proc: bool,
    pub(crate) fake_dbus: bool,
    pub(crate) standard_libs: bool,
    pub(crate) unshare: UnshareOpts,
    pub(crate) log_prefix: String,
    pub(crate) seccomp_fn: Option<SeccompFn>,
    pub(crate) startup_timeout: Duration,

    helper_path: PathBuf,
    helper_version: HelperVersion,
    env: BTreeMap<String, OsString>,
    args: Vec<OsString>,
    file_data: Vec<Vec<u8>>,
}

impl SandboxBuilder {
    pub fn new(helper_override: Option<&Path>) -> Result<Self> {
        let helper_path = match helper_override {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(DEFAULT_HELPER_PATH),
        };
        if !utils::file_exists(&helper_path) {
            return Err(Error::SandboxBuild(format!(
                "unable to find the sandbox helper at {}",
                helper_path.display()
            )));
        }

        let helper_version = query_helper_version(&helper_path)?;
        debug!("sandbox: helper {} detected", helper_version);

        // Helpers this old are ptrace-able while privileged.
        if !helper_version.at_least(0, 1, 3) {
            return Err(Error::SandboxBuild(format!(
                "helper {helper_version} is older than 0.1.3, upgrade it"
            )));
        }

        let mut unshare = UnshareOpts {
            user: false,
            ipc: true,
            pid: true,
            net: true,
            uts: true,
            cgroup: true,
        };
        let mut runtime_dir = PathBuf::from(format!("/run/user/{}", getuid().as_raw()));
        if utils::file_exists("/proc/self/ns/user") {
            debug!("sandbox: user namespace support detected");
            unshare.user = true;
            runtime_dir = PathBuf::from("/run/user/1000");
        }

        let mut b = SandboxBuilder {
            cmd: PathBuf::new(),
            cmd_args: Vec::new(),
            hostname: DEFAULT_HOSTNAME.into(),
            home_dir: PathBuf::from(DEFAULT_HOME),
            runtime_dir: runtime_dir.clone(),
            chdir: None,
            mount_proc: true,
            fake_proc: false,
            fake_dbus: false,
            standard_libs: true,
            unshare,
            log_prefix: "sandbox".into(),
            seccomp_fn: None,
            startup_timeout: STARTUP_TIMEOUT,
            helper_path,
            helper_version,
            env: BTreeMap::new(),
            args: Vec::new(),
            file_data: Vec::new(),
        };
        b.setenv("XDG_RUNTIME_DIR", runtime_dir);
        b.setenv("HOME", PathBuf::from(DEFAULT_HOME));
        Ok(b)
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn setenv(&mut self, key: &str, value: impl Into<OsString>) {
        self.env.insert(key.to_string(), value.into());
    }

    pub fn dir(&mut self, dest: &Path) {
        self.push(&["--dir".as_ref(), dest.as_os_str()]);
    }

    pub fn symlink(&mut self, src: impl AsRef<OsStr>, dest: impl AsRef<OsStr>) {
        self.push(&["--symlink".as_ref(), src.as_ref(), dest.as_ref()]);
    }

    pub fn tmpfs(&mut self, dest: &Path) {
        self.push(&["--tmpfs".as_ref(), dest.as_os_str()]);
    }

    pub fn bind(&mut self, src: &Path, dest: &Path, optional: bool) -> Result<()> {
        self.bind_inner("--bind", src, dest, optional)
    }

    pub fn ro_bind(&mut self, src: &Path, dest: &Path, optional: bool) -> Result<()> {
        self.bind_inner("--ro-bind", src, dest, optional)
    }

    fn bind_inner(&mut self, kind: &str, src: &Path, dest: &Path, optional: bool) -> Result<()> {
        if !utils::file_exists(src) {
            if optional {
                debug!("sandbox: skipping optional bind: {}", src.display());
                return Ok(());
            }
            return Err(Error::SandboxBuild(format!(
                "bind source does not exist: {}",
                src.display()
            )));
        }
        self.push(&[kind.as_ref(), src.as_os_str(), dest.as_os_str()]);
        Ok(())
    }

    /// Injects `data` as a file at `dest`, carried over its own pipe.
    pub fn file(&mut self, dest: &Path, data: Vec<u8>) {
        let fd = ARGS_FD + 1 + self.file_data.len();
        self.push(&["--file".as_ref(), fd.to_string().as_ref(), dest.as_os_str()]);
        self.file_data.push(data);
    }

    /// Replicates the directory tree at `src` as a tmpfs at `dest`:
    /// directories become `--dir`s and regular files are injected with
    /// identical contents, so writes inside the sandbox never reach `src`.
    /// Irregular files fail the build; `excludes` are pruned.
    pub fn shadow_dir(&mut self, dest: &Path, src: &Path, excludes: &[PathBuf]) -> Result<()> {
        debug!("sandbox: shadow_dir {} -> {}", src.display(), dest.display());
        self.tmpfs(dest);
        self.shadow_walk(dest, src, src, excludes)
    }

    fn shadow_walk(
        &mut self,
        dest_root: &Path,
        src_root: &Path,
        dir: &Path,
        excludes: &[PathBuf],
    ) -> Result<()> {
        let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            if excludes.iter().any(|x| *x == path) {
                debug!("sandbox: shadow_dir: excluding {}", path.display());
                continue;
            }

            let rel = path.strip_prefix(src_root).map_err(|_| {
                Error::SandboxBuild(format!("shadow walk escaped {}", src_root.display()))
            })?;
            let dest = dest_root.join(rel);

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.dir(&dest);
                self.shadow_walk(dest_root, src_root, &path, excludes)?;
            } else if file_type.is_file() {
                self.file(&dest, fs::read(&path)?);
            } else {
                return Err(Error::SandboxBuild(format!(
                    "shadow source is not a regular file or directory: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Exposes a resolved library closure inside the sandbox: every
    /// canonical path is bound read-only under its first alias, the
    /// remaining aliases become symlinks, and the dynamic linker lands at
    /// the absolute path executables expect.  Cursory inspection then shows
    /// alias names rather than exact host library versions.
    pub fn append_libraries(
        &mut self,
        closure: &LibraryClosure,
        ld_so: &(PathBuf, PathBuf),
    ) -> Result<()> {
        let (ld_so_path, ld_so_alias) = ld_so;
        let ld_so_alias = Path::new("/lib").join(
            ld_so_alias
                .file_name()
                .ok_or_else(|| Error::SandboxBuild("ld.so alias has no file name".into()))?,
        );

        for (real, aliases) in closure {
            if real == ld_so_path {
                self.ro_bind(real, &ld_so_alias, false)?;
                continue;
            }

            debug!("sandbox: lib: {}", real.display());
            let mut aliases = aliases.iter();
            let Some(first) = aliases.next() else {
                continue;
            };
            let src = Path::new(RESTRICTED_LIB_DIR).join(first);
            self.ro_bind(real, &src, false)?;
            for alias in aliases {
                let dst = Path::new(RESTRICTED_LIB_DIR).join(alias);
                if dst != src {
                    self.symlink(&src, &dst);
                }
            }
        }

        // Some systems are stubborn about the qualified lib directories.
        self.symlink("/lib", "/lib64");
        self.symlink(RESTRICTED_LIB_DIR, "/usr/lib64");
        self.standard_libs = false;

        Ok(())
    }

    /// A synthetic D-Bus machine identity, identical in every sandbox.
    fn setup_dbus(&mut self) {
        const ID_PATH: &str = "/var/lib/dbus/machine-id";

        let mut fake_uuid = [0u8; 16];
        for (i, b) in fake_uuid.iter_mut().enumerate() {
            *b = i as u8;
        }
        self.file(Path::new(ID_PATH), hex::encode(fake_uuid).into_bytes());
        self.symlink(ID_PATH, "/etc/machine-id");
    }

    fn push(&mut self, parts: &[&OsStr]) {
        for p in parts {
            self.args.push(p.to_os_string());
        }
    }

    /// Assembles the complete argument vector in helper order.  Consumes the
    /// pending directives; call once, from `run`.
    fn finalize(&mut self) -> Result<Vec<OsString>> {
        if self.fake_dbus {
            self.setup_dbus();
        }

        let (uid, gid) = if self.unshare.user {
            (1000, 1000)
        } else {
            (getuid().as_raw(), getgid().as_raw())
        };
        let passwd = format!(
            "amnesia:x:{uid}:{gid}:Debian Live User,,,:/home/amnesia:/bin/bash\n"
        );
        let group = format!("amnesia:x:{gid}:\n");
        self.file(Path::new("/etc/passwd"), passwd.into_bytes());
        self.file(Path::new("/etc/group"), group.into_bytes());

        fn push(fd_args: &mut Vec<OsString>, parts: &[&OsStr]) {
            for p in parts {
                fd_args.push(p.to_os_string());
            }
        }

        let mut fd_args: Vec<OsString> = Vec::new();

        // Standard things required by most applications.
        push(&mut fd_args, &["--dev".as_ref(), "/dev".as_ref()]);
        push(&mut fd_args, &["--tmpfs".as_ref(), "/tmp".as_ref()]);
        push(&mut fd_args, &["--dir".as_ref(), self.runtime_dir.as_os_str()]);
        push(&mut fd_args, &["--dir".as_ref(), self.home_dir.as_os_str()]);

        for (k, v) in &self.env {
            push(&mut fd_args, &["--setenv".as_ref(), k.as_ref(), v.as_os_str()]);
        }

        if self.standard_libs {
            push(&mut fd_args, &["--ro-bind".as_ref(), "/usr/lib".as_ref(), "/usr/lib".as_ref()]);
            push(&mut fd_args, &["--ro-bind".as_ref(), "/lib".as_ref(), "/lib".as_ref()]);
            push(&mut fd_args, &["--ro-bind".as_ref(), "/lib64".as_ref(), "/lib64".as_ref()]);
            if utils::file_exists("/usr/lib64") {
                push(&mut fd_args, &["--ro-bind".as_ref(), "/usr/lib64".as_ref(), "/usr/lib64".as_ref()]);
            }
        }

        fd_args.extend(self.unshare.to_args()?);

        if !self.hostname.is_empty() {
            if !self.unshare.uts {
                return Err(Error::SandboxBuild(
                    "hostname set without a new UTS namespace".into(),
                ));
            }
            push(&mut fd_args, &["--hostname".as_ref(), self.hostname.as_ref()]);
        }

        if self.mount_proc {
            push(&mut fd_args, &["--proc".as_ref(), "/proc".as_ref()]);
        } else if self.fake_proc {
            // Enough of /proc/self/task for thread-count probes to see a
            // plausible st_nlink without exposing the real thing.
            push(&mut fd_args, &["--dir".as_ref(), "/proc/self/task/fakeProc".as_ref()]);
        }

        if let Some(chdir) = &self.chdir {
            push(&mut fd_args, &["--chdir".as_ref(), chdir.as_os_str()]);
        }

        if self.unshare.user {
            push(&mut fd_args, &["--uid".as_ref(), "1000".as_ref()]);
            push(&mut fd_args, &["--gid".as_ref(), "1000".as_ref()]);
        }

        if self.helper_version.at_least(0, 1, 8) {
            push(&mut fd_args, &["--die-with-parent".as_ref()]);
        } else {
            warn!(
                "sandbox: helper {} lacks --die-with-parent",
                self.helper_version
            );
        }

        let n_files = self.file_data.len();
        let mut next_fd = ARGS_FD + 1 + n_files;
        if self.seccomp_fn.is_some() {
            push(&mut fd_args, &["--seccomp".as_ref(), next_fd.to_string().as_ref()]);
            next_fd += 1;
        }
        push(&mut fd_args, &["--info-fd".as_ref(), next_fd.to_string().as_ref()]);

        fd_args.append(&mut self.args);
        Ok(fd_args)
    }

    /// Spawns the helper and feeds it the accumulated directives.  Startup
    /// has a hard deadline; a helper that never reports its init pid is
    /// killed.
    pub fn run(mut self) -> Result<Process> {
        let fd_args = self.finalize()?;
        debug!("sandbox: fd args: {fd_args:?}");

        let mut args_buf = Vec::new();
        for arg in &fd_args {
            args_buf.extend_from_slice(arg.as_bytes());
            args_buf.push(0x00);
        }

        // One pipe per payload: arguments, injected files, seccomp program,
        // and the helper's info response.
        let mut child_fds: Vec<OwnedFd> = Vec::new();
        let mut pending_writes: Vec<(OwnedFd, Vec<u8>)> = Vec::new();

        let new_pipe = || -> Result<(OwnedFd, OwnedFd)> {
            pipe2(OFlag::O_CLOEXEC).map_err(|e| {
                Error::SandboxBuild(format!("failed to create helper pipe: {e}"))
            })
        };

        let (args_r, args_w) = new_pipe()?;
        child_fds.push(args_r);
        pending_writes.push((args_w, args_buf));

        for data in std::mem::take(&mut self.file_data) {
            let (r, w) = new_pipe()?;
            child_fds.push(r);
            pending_writes.push((w, data));
        }

        let seccomp = match self.seccomp_fn.take() {
            Some(f) => {
                let (r, w) = new_pipe()?;
                child_fds.push(r);
                Some((f, w))
            }
            None => None,
        };

        let (info_r, info_w) = new_pipe()?;
        child_fds.push(info_w);

        let mut cmd = Command::new(&self.helper_path);
        cmd.arg("--args")
            .arg(ARGS_FD.to_string())
            .arg(&self.cmd)
            .args(&self.cmd_args)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let raw_fds: Vec<i32> = child_fds.iter().map(|f| f.as_raw_fd()).collect();
        let mut staged = vec![0i32; raw_fds.len()];
        let stage_base = ARGS_FD as i32 + raw_fds.len() as i32;
        // SAFETY: only async-signal-safe calls between fork and exec; the
        // staging buffer is allocated up front.
        unsafe {
            cmd.pre_exec(move || {
                libc::setsid();
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) != 0 {
                    return Err(io::Error::last_os_error());
                }

                // Relocate the payload fds to the contiguous range starting
                // at the args fd.  Duplicate everything clear of the target
                // range first, so later sources cannot be clobbered.
                for (i, &fd) in raw_fds.iter().enumerate() {
                    let t = libc::fcntl(fd, libc::F_DUPFD, stage_base);
                    if t < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    staged[i] = t;
                }
                for (i, &t) in staged.iter().enumerate() {
                    if libc::dup2(t, ARGS_FD as i32 + i as i32) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    libc::close(t);
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::SandboxBuild(format!("failed to spawn helper: {e}")))?;
        drop(child_fds);

        // The helper's console goes through the log, line by line.
        for pipe in [
            child.stdout.take().map(|p| Box::new(p) as Box<dyn io::Read + Send>),
            child.stderr.take().map(|p| Box::new(p) as Box<dyn io::Read + Send>),
        ]
        .into_iter()
        .flatten()
        {
            let prefix = self.log_prefix.clone();
            thread::spawn(move || {
                for line in BufReader::new(pipe).lines() {
                    match line {
                        Ok(line) if !line.is_empty() => info!("{prefix}: {line}"),
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            });
        }

        // Flush the payload pipes and collect the init pid off to the side,
        // under the startup watchdog below.
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let feed = move || -> Result<i32> {
                for (fd, buf) in pending_writes {
                    let mut f = File::from(fd);
                    f.write_all(&buf)?;
                }
                if let Some((seccomp_fn, fd)) = seccomp {
                    let mut f = File::from(fd);
                    seccomp_fn(&mut f)?;
                }

                let mut de = serde_json::Deserializer::from_reader(File::from(info_r));
                let info = HelperInfo::deserialize(&mut de)
                    .map_err(|e| Error::SandboxBuild(format!("bad helper info blob: {e}")))?;
                Ok(info.child_pid)
            };
            let _ = tx.send(feed());
        });

        let mut process = Process::new(child);
        let deadline = self.startup_timeout.as_secs().max(1);
        for _ in 0..deadline {
            match rx.recv_timeout(Duration::from_secs(1)) {
                Ok(Ok(init_pid)) => {
                    debug!("sandbox: helper init pid is {init_pid}");
                    process.set_init_pid(init_pid);
                    return Ok(process);
                }
                Ok(Err(e)) => {
                    process.kill();
                    return Err(e);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !process.running() {
                        return Err(Error::SandboxBuild("helper exited unexpectedly".into()));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    process.kill();
                    return Err(Error::SandboxBuild("helper setup thread died".into()));
                }
            }
        }

        process.kill();
        Err(Error::SandboxBuild(
            "timeout waiting for the helper to start".into(),
        ))
    }
}
