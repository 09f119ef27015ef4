//! The bounded sub-worker pool.
//!
//! Each sub-worker is a fresh one-shot instance of the helper executable:
//! it receives a single request on its stdin pipe, performs the blocking
//! lookup, writes the response datagram straight to the server on the
//! inherited channel descriptor, and exits. The pool caps how many may be
//! outstanding; past the cap the helper's own loop does the lookup inline
//! instead, so no request is ever dropped for lack of a worker.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use crate::lookup::wire::REQUEST_SIZE;

/// How many sub-workers may be outstanding at once.
pub const MAX_SUBWORKERS: usize = 5;

/// Argument selecting the one-shot sub-worker mode of the executable.
pub const ONESHOT_ARG: &str = "--one-shot";

//------------ SubworkerPool -------------------------------------------------

/// A bounded pool of one-shot lookup processes.
pub struct SubworkerPool {
    /// Sub-workers spawned and not yet reaped.
    children: Vec<Child>,

    /// The concurrency cap.
    cap: usize,

    /// The executable to run, normally the helper's own binary.
    exe: PathBuf,
}

impl SubworkerPool {
    /// Creates an empty pool running the given executable.
    pub fn new(cap: usize, exe: PathBuf) -> Self {
        Self {
            children: Vec::with_capacity(cap),
            cap,
            exe,
        }
    }

    /// Is there room for another sub-worker?
    pub fn has_capacity(&self) -> bool {
        self.children.len() < self.cap
    }

    /// How many sub-workers are outstanding.
    pub fn in_flight(&self) -> usize {
        self.children.len()
    }

    /// Starts a sub-worker for one request.
    ///
    /// The request datagram is handed over on the child's stdin; the
    /// child's stdout is inherited so its response goes directly onto the
    /// channel to the server. The caller checks [`Self::has_capacity`]
    /// first; this only enforces I/O errors, not the cap.
    pub fn spawn(&mut self, request: &[u8; REQUEST_SIZE]) -> io::Result<()> {
        let mut child = Command::new(&self.exe)
            .arg(ONESHOT_ARG)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let handed_over = stdin.write_all(request);
        drop(stdin);
        match handed_over {
            Ok(()) => {
                self.children.push(child);
                Ok(())
            }
            Err(err) => {
                // The worker never got its request; don't leave a zombie.
                let _ = child.kill();
                let _ = child.wait();
                Err(err)
            }
        }
    }

    /// Collects exited sub-workers, returning how many were reaped.
    pub fn reap(&mut self) -> usize {
        let before = self.children.len();
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            // The handle is unusable; forget it rather than loop on it.
            Err(_) => false,
        });
        before - self.children.len()
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, Instant};

    /// Writes a stand-in worker script that drains stdin and exits.
    fn stub_worker() -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "mudnet-stub-worker-{}",
            std::process::id()
        ));
        std::fs::write(&path, "#!/bin/sh\ncat >/dev/null\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn capacity_is_enforced_and_reaping_frees_it() {
        let exe = stub_worker();
        let mut pool = SubworkerPool::new(2, exe.clone());
        let request = [0; REQUEST_SIZE];

        assert!(pool.has_capacity());
        pool.spawn(&request).unwrap();
        pool.spawn(&request).unwrap();
        assert!(!pool.has_capacity());
        assert_eq!(pool.in_flight(), 2);

        // The stubs exit as soon as stdin is drained; reap until both
        // are gone.
        let deadline = Instant::now() + Duration::from_secs(10);
        while pool.in_flight() > 0 {
            pool.reap();
            assert!(Instant::now() < deadline, "stub workers never exited");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(pool.has_capacity());

        let _ = std::fs::remove_file(exe);
    }

    #[test]
    fn spawn_failure_is_an_error_not_a_panic() {
        let mut pool =
            SubworkerPool::new(1, PathBuf::from("/nonexistent/worker"));
        assert!(pool.spawn(&[0; REQUEST_SIZE]).is_err());
        assert_eq!(pool.in_flight(), 0);
    }
}
