//! Pty process primitives: spawn a shell under a fresh pseudo-terminal,
//! resize it, and decode its wait status.

use std::env;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process;
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

/// Handle to a spawned pty child: the master side fd plus the child pid.
pub struct PtyHandle {
    pub master: Arc<OwnedFd>,
    pub pid: i32,
}

/// Spawn `shell` in a new pty with the given window size and working
/// directory. The child gets `TERM=xterm-256color` and execs the shell
/// directly; exec failure exits 127.
pub fn spawn_shell(shell: &str, cwd: &str, cols: u16, rows: u16) -> io::Result<PtyHandle> {
    let mut winsize = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    let mut master_fd: libc::c_int = -1;
    let pid = unsafe {
        libc::forkpty(
            &mut master_fd as *mut libc::c_int,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut winsize as *mut libc::winsize,
        )
    };

    if pid < 0 {
        return Err(io::Error::last_os_error());
    }

    if pid == 0 {
        // Child process
        env::set_var("TERM", "xterm-256color");
        if env::set_current_dir(cwd).is_err() {
            eprintln!("pane-host: failed to chdir to {}", cwd);
        }

        let c_shell = std::ffi::CString::new(shell).unwrap_or_else(|_| {
            eprintln!("pane-host: invalid shell path");
            process::exit(127);
        });
        let c_argv: Vec<*const libc::c_char> = [c_shell.as_ptr(), std::ptr::null()].to_vec();

        unsafe {
            libc::execvp(c_shell.as_ptr(), c_argv.as_ptr());
        }
        // If execvp returns, it failed
        let err = io::Error::last_os_error();
        eprintln!("pane-host: exec failed: {}", err);
        process::exit(127);
    }

    // Parent process
    // SAFETY: master_fd is valid from forkpty
    let owned = unsafe { OwnedFd::from_raw_fd(master_fd) };
    // Non-blocking from the start: readers and writers may touch the fd
    // before the read task runs.
    set_nonblocking(owned.as_raw_fd());
    Ok(PtyHandle {
        master: Arc::new(owned),
        pid,
    })
}

pub fn resize_pty(master_fd: RawFd, cols: u16, rows: u16) {
    let ws = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe {
        libc::ioctl(master_fd, libc::TIOCSWINSZ, &ws);
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

/// Best-effort signal delivery; callers decide whether failure matters.
pub fn send_signal(pid: i32, signal: Signal) -> nix::Result<()> {
    kill(Pid::from_raw(pid), signal)
}

/// Reap the child and decode its status into `(exit_code, signal)`.
pub fn wait_for_exit(pid: i32) -> (Option<i32>, Option<i32>) {
    match waitpid(Pid::from_raw(pid), None) {
        Ok(WaitStatus::Exited(_, code)) => (Some(code), None),
        Ok(WaitStatus::Signaled(_, sig, _)) => (None, Some(sig as i32)),
        _ => (None, None),
    }
}

/// `AsRawFd` wrapper so the read task can register the master with
/// `AsyncFd` while keeping the fd alive via the shared handle.
pub struct MasterFd(pub Arc<OwnedFd>);

impl AsRawFd for MasterFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
