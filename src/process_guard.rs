//! Child process lifecycle
//!
//! Provisioning shells out to long-running programs (`apt-get`, `docker compose
//! pull`, `openssl dhparam`, `certbot`). If the provisioner is interrupted, those
//! children must not keep mutating the host on their own.
//!
//! - every child is spawned as the leader of its own process group and gets
//!   `PR_SET_PDEATHSIG`
//! - live children are tracked in a global registry through `ChildTicket`
//! - SIGINT/SIGTERM/SIGHUP signal every tracked group (SIGTERM, grace, SIGKILL)

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Grace period between SIGTERM and SIGKILL on signal-driven shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Registry of running child process groups
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Global registry shared by every `SystemHost`
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        log::debug!("Tracking child process group {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        log::debug!("Released child process group {}", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Signal every tracked process group: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Runs at most once per registry.
    pub fn terminate_all(&mut self, grace: Duration) {
        if self.cleanup_initiated {
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            return;
        }

        let targets: Vec<u32> = self.pids.iter().copied().collect();
        log::warn!("Stopping {} running command(s)", targets.len());

        for &pid in &targets {
            if let Err(e) = signal_group(pid, Signal::SIGTERM) {
                log::debug!("SIGTERM to group {} failed ({}), signalling process", pid, e);
                let _ = signal_process(pid, Signal::SIGTERM);
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            if targets.iter().all(|&pid| !is_process_alive(pid)) {
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in targets.iter().filter(|&&pid| is_process_alive(pid)) {
            log::warn!("Process group {} ignored SIGTERM, sending SIGKILL", pid);
            if signal_group(pid, Signal::SIGKILL).is_err() {
                let _ = signal_process(pid, Signal::SIGKILL);
            }
        }
        self.pids.clear();
    }
}

fn signal_process(pid: u32, sig: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), sig)
}

/// Negative PID addresses the whole group (the child plus anything it forked)
fn signal_group(pgid: u32, sig: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), sig)
}

/// Alive means it exists and is neither a zombie nor dead
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => {
            // state is the first field after the parenthesised command name
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next());
            !matches!(state, Some("Z") | Some("X"))
        }
        Err(_) => true,
    }
}

/// Registration of one spawned child; unregisters on drop.
///
/// Held by `SystemHost` for the lifetime of the child so every exit path,
/// including an early `?`, releases the registry entry.
#[derive(Debug)]
pub struct ChildTicket {
    pid: u32,
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ChildTicket {
    /// Register `pid` in the global registry
    pub fn register(pid: u32) -> Self {
        Self::register_in(ChildRegistry::global(), pid)
    }

    pub fn register_in(registry: Arc<Mutex<ChildRegistry>>, pid: u32) -> Self {
        if let Ok(mut guard) = registry.lock() {
            guard.register(pid);
        }
        Self { pid, registry }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for ChildTicket {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.registry.lock() {
            guard.unregister(self.pid);
        }
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handlers that stop tracked children and exit 128+signal.
///
/// Call once, early in `main`.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                _ => "SIGHUP",
            };
            log::warn!("Received {}, host may be partially provisioned", name);
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(SHUTDOWN_GRACE);
            }
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for `std::process::Command`
pub trait CommandProcessGroup {
    /// Spawn as leader of a new process group, dying with the parent
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe functions (setpgid, prctl)
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn reap(child: &mut std::process::Child, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(_)) = child.try_wait() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_ticket_unregisters_on_drop() {
        let registry = Arc::new(Mutex::new(ChildRegistry::default()));
        {
            let ticket = ChildTicket::register_in(registry.clone(), 4242);
            assert_eq!(ticket.pid(), 4242);
            assert_eq!(registry.lock().unwrap().count(), 1);
        }
        assert_eq!(registry.lock().unwrap().count(), 0);
    }

    #[test]
    fn test_terminate_all_stops_process_group() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 60"])
            .in_new_process_group()
            .spawn()
            .expect("spawn sleep");

        let mut registry = ChildRegistry::default();
        registry.register(child.id());
        registry.terminate_all(Duration::from_millis(500));

        assert!(reap(&mut child, Duration::from_secs(3)));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_terminate_all_runs_once() {
        let mut registry = ChildRegistry::default();
        registry.register(999_999);
        registry.terminate_all(Duration::from_millis(10));
        assert!(registry.cleanup_initiated);

        registry.register(999_998);
        registry.terminate_all(Duration::from_millis(10));
        // second call is a no-op, the new entry stays
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_missing_process_is_not_alive() {
        assert!(!is_process_alive(999_999));
        assert!(signal_process(999_999, Signal::SIGTERM).is_err());
    }
}
