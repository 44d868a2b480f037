use nix::sys::resource::{Resource, getrlimit, setrlimit};

use crate::error::{Error, Result};

/// Lowers both the soft and hard limit for `resource` to at most
/// `new_hard`, leaving already-tighter limits alone.
fn lower_rlimit(resource: Resource, new_hard: u64) -> Result<()> {
    let (soft, hard) = getrlimit(resource)
        .map_err(|e| Error::Fatal(format!("failed to query {resource:?}: {e}")))?;

    let new_soft = soft.min(new_hard);
    let new_hard = hard.min(new_hard);
    if new_soft == soft && new_hard == hard {
        return Ok(());
    }

    setrlimit(resource, new_soft, new_hard)
        .map_err(|e| Error::Fatal(format!("failed to lower {resource:?}: {e}")))
}

/// Conservatively lowers the resource limits to values that still support
/// the browser, the updater, the daemon, and its pluggable transports.
/// Applied to the launcher before anything sandboxed starts, so the whole
/// process tree inherits them.
pub fn set_sensible_rlimits() -> Result<()> {
    const LIM_STACK: u64 = 8 * 1024 * 1024; // Firefox uses a lot with js.
    const LIM_RSS: u64 = 0; // No effect since 2.6.x.
    const LIM_NOFILE: u64 = 1024;
    const LIM_MEMLOCK: u64 = 0;
    const LIM_LOCKS: u64 = 32;
    const LIM_SIGPENDING: u64 = 64;
    const LIM_MSGQUEUE: u64 = 0; // Disallowed by seccomp anyway.
    const LIM_NICE: u64 = 0;
    const LIM_RTPRIO: u64 = 0;
    const LIM_RTTIME: u64 = 0;

    let limits = [
        (Resource::RLIMIT_STACK, LIM_STACK),
        (Resource::RLIMIT_RSS, LIM_RSS),
        (Resource::RLIMIT_NOFILE, LIM_NOFILE),
        (Resource::RLIMIT_MEMLOCK, LIM_MEMLOCK),
        (Resource::RLIMIT_LOCKS, LIM_LOCKS),
        (Resource::RLIMIT_SIGPENDING, LIM_SIGPENDING),
        (Resource::RLIMIT_MSGQUEUE, LIM_MSGQUEUE),
        (Resource::RLIMIT_NICE, LIM_NICE),
        (Resource::RLIMIT_RTPRIO, LIM_RTPRIO),
        (Resource::RLIMIT_RTTIME, LIM_RTTIME),
    ];
    for (resource, limit) in limits {
        lower_rlimit(resource, limit)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower_rlimit_leaves_tighter_limits_alone() {
        // Asking for the current hard limit changes nothing.
        let (_, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        lower_rlimit(Resource::RLIMIT_NOFILE, hard).unwrap();
        let (_, after) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        assert_eq!(hard, after);
    }

    #[test]
    fn test_lower_rlimit_clamps_both_limits() {
        // RTTIME is unused by the test process, so clamping it to zero is
        // observable and harmless.
        lower_rlimit(Resource::RLIMIT_RTTIME, 0).unwrap();
        assert_eq!(getrlimit(Resource::RLIMIT_RTTIME).unwrap(), (0, 0));

        // Lowering is one-way; the idempotent retry still succeeds.
        lower_rlimit(Resource::RLIMIT_RTTIME, 0).unwrap();
    }
}
