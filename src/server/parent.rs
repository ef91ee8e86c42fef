//! Parent liveness checks for child processes
//!
//! A host passes its own pid as `argv[1]`; the child polls it so it can exit
//! instead of lingering as an orphan when the host dies without stopping it.

/// Parse the parent pid from `argv[1]`, if one was passed.
///
/// A non-numeric `argv[1]` means the host launched the child without a pid
/// (`pass_parent_pid = false`) and that argument belongs to the child, so no
/// parent is watched. Exiting on it would kill every child started that way.
pub fn parent_pid_from_args<S: AsRef<str>>(args: &[S]) -> Option<u32> {
    args.get(1)?.as_ref().trim().parse().ok()
}

/// True if a process with `pid` still exists
#[cfg(unix)]
pub fn parent_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Parent watching is unsupported here; the parent is assumed alive
#[cfg(not(unix))]
pub fn parent_alive(_pid: u32) -> bool {
    true
}
