//! Portable event waiting for the lookup helper.
//!
//! The helper has to block until any one of three things happens: a request
//! datagram becomes readable, the parent server dies, or a sub-worker
//! exits. No single portable primitive covers all three, so this module
//! probes for the best available strategy once at startup:
//!
//! * **kqueue** (BSD, macOS): descriptor readiness, process exit, and
//!   signal delivery all through one kernel queue. Parent death and child
//!   exit are genuine kernel events; no polling needed.
//! * **poll**: descriptors only. Parent death degrades to waking every
//!   five seconds and checking whether the recorded parent pid still
//!   matches; once the helper has been re-parented the original parent is
//!   gone. Child exit is reported through a SIGCHLD handler that sets a
//!   flag.
//! * **select**: same fallbacks as poll, on the older multiplexer API.
//!
//! Registration failures before the loop starts are fatal to the helper;
//! a failing [`EventWait::wait`] after that point makes the helper exit
//! non-zero and leaves recovery to the server's respawn logic.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

/// How long poll/select sleep between parent-liveness checks.
const PARENT_POLL_MS: i32 = 5000;

/// Set by the SIGCHLD handler under the poll/select strategies.
static CHILD_EXITED: AtomicBool = AtomicBool::new(false);

//------------ Event ---------------------------------------------------------

/// What a successful wait observed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// A watched descriptor has bytes ready.
    Readable(RawFd),

    /// The parent process is gone.
    ParentExited,

    /// At least one child process has exited and wants reaping.
    ChildExited,
}

//------------ WaitError -----------------------------------------------------

/// Why a wait did not produce an event.
#[derive(Debug)]
pub enum WaitError {
    /// The wait was interrupted by a signal; retry it.
    Interrupted,

    /// The wait failed for real; the helper should exit.
    Fatal(io::Error),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Interrupted => f.write_str("interrupted by signal"),
            WaitError::Fatal(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for WaitError {}

//------------ Strategy ------------------------------------------------------

/// One way of waiting for the helper's three event classes.
///
/// All strategies implement the same watch/wait contract; which one is in
/// use is decided once by [`EventWait::init`] and never changes.
trait Strategy {
    /// The name logged at startup.
    fn name(&self) -> &'static str;

    /// Registers a descriptor for read-readiness.
    fn watch_readable(&mut self, fd: RawFd) -> io::Result<()>;

    /// Registers interest in the parent process's termination.
    fn watch_parent_exit(&mut self) -> io::Result<()>;

    /// Registers interest in descendant-process termination.
    fn watch_child_exit(&mut self) -> io::Result<()>;

    /// Blocks until one registered event fires.
    fn wait(&mut self) -> Result<Event, WaitError>;
}

//------------ EventWait -----------------------------------------------------

/// The helper's event waiter, bound to the strategy probed at startup.
pub struct EventWait {
    strategy: Box<dyn Strategy>,
}

impl EventWait {
    /// Probes for a usable strategy, best first.
    ///
    /// Fails only when no strategy works at all, which is a fatal
    /// misconfiguration of the platform.
    pub fn init() -> io::Result<Self> {
        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly",
        ))]
        if let Ok(strategy) = Kqueue::new() {
            return Ok(Self {
                strategy: Box::new(strategy),
            });
        }

        if Poll::probe() {
            return Ok(Self {
                strategy: Box::new(Poll::new()),
            });
        }

        Ok(Self {
            strategy: Box::new(Select::new()),
        })
    }

    /// The name of the strategy in use, for the startup log line.
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Registers a descriptor for read-readiness.
    ///
    /// May be called for any number of descriptors.
    pub fn watch_readable(&mut self, fd: RawFd) -> io::Result<()> {
        self.strategy.watch_readable(fd)
    }

    /// Registers interest in the parent process's termination.
    pub fn watch_parent_exit(&mut self) -> io::Result<()> {
        self.strategy.watch_parent_exit()
    }

    /// Registers interest in descendant-process termination.
    pub fn watch_child_exit(&mut self) -> io::Result<()> {
        self.strategy.watch_child_exit()
    }

    /// Blocks until one registered event fires.
    pub fn wait(&mut self) -> Result<Event, WaitError> {
        self.strategy.wait()
    }
}

//------------ Kqueue --------------------------------------------------------

/// Kernel event queue strategy for the BSD family.
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
struct Kqueue {
    kq: RawFd,
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
impl Kqueue {
    fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { kq })
    }

    fn add(&mut self, mut ev: libc::kevent) -> io::Result<()> {
        ev.flags = libc::EV_ADD | libc::EV_ENABLE;
        let zero = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc =
            unsafe { libc::kevent(self.kq, &ev, 1, ptr::null_mut(), 0, &zero) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
impl Strategy for Kqueue {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn watch_readable(&mut self, fd: RawFd) -> io::Result<()> {
        let mut ev: libc::kevent = unsafe { mem::zeroed() };
        ev.ident = fd as _;
        ev.filter = libc::EVFILT_READ;
        self.add(ev)
    }

    fn watch_parent_exit(&mut self) -> io::Result<()> {
        let mut ev: libc::kevent = unsafe { mem::zeroed() };
        ev.ident = unsafe { libc::getppid() } as _;
        ev.filter = libc::EVFILT_PROC;
        ev.fflags = libc::NOTE_EXIT;
        self.add(ev)
    }

    fn watch_child_exit(&mut self) -> io::Result<()> {
        // SIGCHLD must be blocked for the signal filter to see it instead
        // of the default disposition.
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, libc::SIGCHLD);
            if libc::sigprocmask(libc::SIG_BLOCK, &mask, ptr::null_mut()) < 0
            {
                return Err(io::Error::last_os_error());
            }
        }
        let mut ev: libc::kevent = unsafe { mem::zeroed() };
        ev.ident = libc::SIGCHLD as _;
        ev.filter = libc::EVFILT_SIGNAL;
        self.add(ev)
    }

    fn wait(&mut self) -> Result<Event, WaitError> {
        let mut triggered: [libc::kevent; 4] = unsafe { mem::zeroed() };
        let got = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                triggered.as_mut_ptr(),
                triggered.len() as _,
                ptr::null(),
            )
        };
        if got < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::Interrupted {
                Err(WaitError::Interrupted)
            } else {
                Err(WaitError::Fatal(err))
            };
        }

        // Parent death outranks everything; a signal-only wakeup still has
        // to be reported so the caller reaps.
        let mut child = false;
        let mut readable = None;
        for ev in &triggered[..got as usize] {
            match ev.filter {
                libc::EVFILT_PROC => return Ok(Event::ParentExited),
                libc::EVFILT_SIGNAL => child = true,
                libc::EVFILT_READ => readable = Some(ev.ident as RawFd),
                _ => {}
            }
        }
        match readable {
            Some(fd) => Ok(Event::Readable(fd)),
            None if child => Ok(Event::ChildExited),
            None => Err(WaitError::Interrupted),
        }
    }
}

//------------ Poll ----------------------------------------------------------

/// Descriptor-only strategy with timed parent-liveness checks.
struct Poll {
    fds: Vec<libc::pollfd>,
    parent: Option<libc::pid_t>,
}

impl Poll {
    fn new() -> Self {
        Self {
            fds: Vec::new(),
            parent: None,
        }
    }

    /// Checks whether poll(2) actually works here.
    fn probe() -> bool {
        let rc = unsafe { libc::poll(ptr::null_mut(), 0, 0) };
        rc >= 0 || io::Error::last_os_error().raw_os_error()
            != Some(libc::ENOSYS)
    }
}

impl Strategy for Poll {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn watch_readable(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        Ok(())
    }

    fn watch_parent_exit(&mut self) -> io::Result<()> {
        self.parent = Some(unsafe { libc::getppid() });
        Ok(())
    }

    fn watch_child_exit(&mut self) -> io::Result<()> {
        install_sigchld_flag_handler()
    }

    fn wait(&mut self) -> Result<Event, WaitError> {
        let timeout = if self.parent.is_some() {
            PARENT_POLL_MS
        } else {
            -1
        };
        loop {
            if CHILD_EXITED.swap(false, Ordering::Relaxed) {
                return Ok(Event::ChildExited);
            }
            let rc = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    timeout,
                )
            };
            if rc > 0 {
                for pfd in &self.fds {
                    if pfd.revents
                        & (libc::POLLIN | libc::POLLHUP | libc::POLLERR)
                        != 0
                    {
                        return Ok(Event::Readable(pfd.fd));
                    }
                }
            } else if rc == 0 {
                if let Some(parent) = self.parent {
                    // Re-parented means the original parent is gone.
                    if unsafe { libc::getppid() } != parent {
                        return Ok(Event::ParentExited);
                    }
                }
            } else {
                let err = io::Error::last_os_error();
                return if err.kind() == io::ErrorKind::Interrupted {
                    Err(WaitError::Interrupted)
                } else {
                    Err(WaitError::Fatal(err))
                };
            }
        }
    }
}

//------------ Select --------------------------------------------------------

/// Last-resort strategy on the oldest multiplexer API.
struct Select {
    fds: Vec<RawFd>,
    parent: Option<libc::pid_t>,
}

impl Select {
    fn new() -> Self {
        Self {
            fds: Vec::new(),
            parent: None,
        }
    }
}

impl Strategy for Select {
    fn name(&self) -> &'static str {
        "select"
    }

    fn watch_readable(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.push(fd);
        Ok(())
    }

    fn watch_parent_exit(&mut self) -> io::Result<()> {
        self.parent = Some(unsafe { libc::getppid() });
        Ok(())
    }

    fn watch_child_exit(&mut self) -> io::Result<()> {
        install_sigchld_flag_handler()
    }

    fn wait(&mut self) -> Result<Event, WaitError> {
        loop {
            if CHILD_EXITED.swap(false, Ordering::Relaxed) {
                return Ok(Event::ChildExited);
            }
            let mut set: libc::fd_set = unsafe { mem::zeroed() };
            let mut nfds = 0;
            unsafe {
                libc::FD_ZERO(&mut set);
                for &fd in &self.fds {
                    libc::FD_SET(fd, &mut set);
                    nfds = nfds.max(fd + 1);
                }
            }
            let mut timeout = libc::timeval {
                tv_sec: (PARENT_POLL_MS / 1000) as libc::time_t,
                tv_usec: 0,
            };
            let timeout_ptr = if self.parent.is_some() {
                &mut timeout as *mut _
            } else {
                ptr::null_mut()
            };
            let rc = unsafe {
                libc::select(
                    nfds,
                    &mut set,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    timeout_ptr,
                )
            };
            if rc > 0 {
                for &fd in &self.fds {
                    if unsafe { libc::FD_ISSET(fd, &set) } {
                        return Ok(Event::Readable(fd));
                    }
                }
            } else if rc == 0 {
                if let Some(parent) = self.parent {
                    if unsafe { libc::getppid() } != parent {
                        return Ok(Event::ParentExited);
                    }
                }
            } else {
                let err = io::Error::last_os_error();
                return if err.kind() == io::ErrorKind::Interrupted {
                    Err(WaitError::Interrupted)
                } else {
                    Err(WaitError::Fatal(err))
                };
            }
        }
    }
}

//------------ Helper Functions ----------------------------------------------

extern "C" fn mark_child_exited(_signo: libc::c_int) {
    CHILD_EXITED.store(true, Ordering::Relaxed);
}

/// Installs the SIGCHLD handler used by the poll/select strategies.
///
/// The handler only sets a flag; reaping happens synchronously in the
/// helper's own loop when the flag is observed.
fn install_sigchld_flag_handler() -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction =
            mark_child_exited as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = 0;
        if libc::sigaction(libc::SIGCHLD, &sa, ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn init_finds_a_strategy() {
        let waiter = EventWait::init().unwrap();
        assert!(!waiter.strategy_name().is_empty());
    }

    #[test]
    fn readable_descriptor_is_reported() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let mut waiter = EventWait::init().unwrap();
        waiter.watch_readable(rx.as_raw_fd()).unwrap();
        tx.write_all(b"x").unwrap();
        // Not watching the parent here, so the only possible wakeup is
        // the descriptor itself.
        match waiter.wait() {
            Ok(Event::Readable(fd)) => assert_eq!(fd, rx.as_raw_fd()),
            other => panic!("unexpected wait result: {other:?}"),
        }
    }

    #[test]
    fn two_descriptors_can_be_watched() {
        let (mut tx_a, rx_a) = UnixStream::pair().unwrap();
        let (_tx_b, rx_b) = UnixStream::pair().unwrap();
        let mut waiter = EventWait::init().unwrap();
        waiter.watch_readable(rx_b.as_raw_fd()).unwrap();
        waiter.watch_readable(rx_a.as_raw_fd()).unwrap();
        tx_a.write_all(b"y").unwrap();
        match waiter.wait() {
            Ok(Event::Readable(fd)) => assert_eq!(fd, rx_a.as_raw_fd()),
            other => panic!("unexpected wait result: {other:?}"),
        }
    }
}
