//! Host-application plumbing: daemonization, termination wait, and the
//! BSD sysexits codes the binary reports.

use std::io;
use std::process;
use std::{env, mem, ptr};

use crate::sys::syscall;

/// Successful termination.
pub const EXIT_OK: i32 = 0;
/// Command line usage error.
pub const EXIT_USAGE: i32 = 64;
/// Internal software error.
pub const EXIT_SOFTWARE: i32 = 70;
/// Operating system error (e.g. can't fork).
pub const EXIT_OSERR: i32 = 71;
/// Configuration error.
pub const EXIT_CONFIG: i32 = 78;

/// Detaches the process from its controlling terminal: forks (the parent
/// exits), starts a new session, tightens the umask, and points the
/// standard streams at `/dev/null`. The caller should `chdir("/")`
/// afterwards if it does not depend on the working directory.
pub fn daemonize() -> io::Result<()> {
    let pid = syscall!(fork())?;
    if pid != 0 {
        process::exit(EXIT_OK);
    }

    syscall!(setsid())?;
    unsafe {
        libc::umask(0o027);
    }

    let devnull = syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDWR
    ))?;
    for fd in 0..3 {
        syscall!(dup2(devnull, fd))?;
    }
    if devnull > 2 {
        syscall!(close(devnull))?;
    }

    Ok(())
}

fn termination_sigset() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);

        if env::var_os("ENABLE_DEBUGGER").is_none() {
            libc::sigaddset(&mut set, libc::SIGINT);
        }
        libc::sigaddset(&mut set, libc::SIGQUIT);
        libc::sigaddset(&mut set, libc::SIGTERM);

        set
    }
}

/// Blocks the termination signals (SIGQUIT, SIGTERM, and SIGINT unless
/// `ENABLE_DEBUGGER` is set) on the calling thread.
///
/// Call this before spawning worker threads so they inherit the mask and
/// the signals stay routed to [`wait_for_termination`].
pub fn block_termination_signals() -> io::Result<()> {
    let set = termination_sigset();

    // pthread_sigmask reports errors as a return value, not through errno
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }

    Ok(())
}

/// Blocks the calling thread until one of the termination signals
/// arrives. [`block_termination_signals`] must have run first.
pub fn wait_for_termination() -> io::Result<()> {
    let set = termination_sigset();

    let mut sig: libc::c_int = 0;
    let rc = unsafe { libc::sigwait(&set, &mut sig) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }

    Ok(())
}
