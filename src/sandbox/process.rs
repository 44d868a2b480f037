use std::process::Child;

use log::{debug, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// A running sandbox helper instance, together with the pid of the init
/// process inside its pid namespace.  Killing init tears down everything in
/// the namespace, which is why an unshared pid namespace is mandatory.
pub struct Process {
    child: Option<Child>,
    init_pid: Option<Pid>,
    term_hooks: Vec<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("child", &self.child)
            .field("init_pid", &self.init_pid)
            .field("term_hooks", &self.term_hooks.len())
            .finish()
    }
}

impl Process {
    pub fn new(child: Child) -> Self {
        Process {
            child: Some(child),
            init_pid: None,
            term_hooks: Vec::new(),
        }
    }

    /// Records the pid of the helper's init fork, read back from the info
    /// pipe.  Only the sandbox spawn path calls this.
    pub(crate) fn set_init_pid(&mut self, pid: i32) {
        assert!(self.init_pid.is_none(), "init pid already set");
        self.init_pid = Some(Pid::from_raw(pid));
    }

    /// Registers `hook` to run when the sandbox terminates.  Hooks run
    /// exactly once, in registration order, on whichever of kill/wait
    /// observes the exit.
    pub fn add_term_hook<F: FnOnce() + Send + 'static>(&mut self, hook: F) {
        self.term_hooks.push(Box::new(hook));
    }

    /// Terminates the helper and everything inside the namespace, init
    /// first.
    pub fn kill(&mut self) {
        if let Some(pid) = self.init_pid.take() {
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                debug!("process: failed to kill namespace init {pid}: {e}");
            }
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("process: failed to kill helper: {e}");
            }
            if let Err(e) = child.wait() {
                warn!("process: failed to reap helper: {e}");
            }
        }
        self.on_exit();
    }

    /// Blocks until the helper exits.  The init process is a grandchild and
    /// cannot be waited on directly.
    pub fn wait(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.wait() {
                warn!("process: failed to reap helper: {e}");
            }
            self.on_exit();
        }
    }

    /// Non-blocking liveness check, reaping the helper if it has exited.
    pub fn running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => {
                self.child = None;
                self.on_exit();
                false
            }
        }
    }

    fn on_exit(&mut self) {
        for hook in self.term_hooks.drain(..) {
            hook();
        }
    }
}
