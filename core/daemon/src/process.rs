//! Process control for bot clients.
//!
//! The fleet core only sees [`ProcessHandle`]. [`ClientLauncher`] is the
//! concrete implementation that runs the Java bot client.

use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{FleetError, Result};

/// What to launch for one bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub email: String,
    pub script: String,
    pub params: Vec<String>,
}

/// Capability to start, stop and probe external worker processes.
pub trait ProcessHandle: Send + Sync {
    /// Launches the process and returns its pid.
    fn start(&self, spec: &LaunchSpec) -> Result<u32>;

    fn stop(&self, pid: u32) -> Result<()>;

    /// `Err` means liveness could not be determined, which is not the same as dead.
    fn is_alive(&self, pid: u32) -> Result<bool>;
}

pub struct ClientLauncher {
    config: ClientConfig,
    // Children we spawned; kept so exited ones get reaped instead of lingering as zombies.
    children: Mutex<HashMap<u32, Child>>,
}

impl ClientLauncher {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn children(&self) -> MutexGuard<'_, HashMap<u32, Child>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProcessHandle for ClientLauncher {
    fn start(&self, spec: &LaunchSpec) -> Result<u32> {
        let args = client_args(&self.config, spec);
        info!(
            email = %spec.email,
            script = %spec.script,
            command = %format!("{} {}", self.config.java, args.join(" ")),
            "Starting bot client"
        );

        let child = Command::new(&self.config.java)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                FleetError::process(format!("Failed to spawn client for {}", spec.email), err)
            })?;

        let pid = child.id();
        self.children().insert(pid, child);
        info!(email = %spec.email, pid, "Bot client started");
        Ok(pid)
    }

    fn stop(&self, pid: u32) -> Result<()> {
        if pid == 0 {
            return Ok(());
        }

        let owned = self.children().remove(&pid);
        if let Some(mut child) = owned {
            if let Err(err) = child.kill() {
                // InvalidInput: the child already exited.
                if err.kind() != std::io::ErrorKind::InvalidInput {
                    return Err(FleetError::process(
                        format!("Failed to kill client pid {}", pid),
                        err,
                    ));
                }
            }
            let _ = child.wait();
            info!(pid, "Bot client stopped");
            return Ok(());
        }

        signal_terminate(pid)?;
        info!(pid, "Sent SIGTERM to bot client");
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> Result<bool> {
        if pid == 0 {
            return Ok(false);
        }

        {
            let mut children = self.children();
            if let Some(child) = children.get_mut(&pid) {
                return match child.try_wait() {
                    Ok(None) => Ok(true),
                    Ok(Some(status)) => {
                        debug!(pid, status = %status, "Reaped exited bot client");
                        children.remove(&pid);
                        Ok(false)
                    }
                    Err(err) => Err(FleetError::process(
                        format!("Failed to poll client pid {}", pid),
                        err,
                    )),
                };
            }
        }

        probe_pid(pid)
    }
}

/// Client command-line arguments, excluding the java executable itself.
pub fn client_args(config: &ClientConfig, spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec![
        "-jar".to_string(),
        config.client_jar.display().to_string(),
        "-account".to_string(),
        spec.email.clone(),
        "-script".to_string(),
        spec.script.clone(),
        "-world".to_string(),
        config.world.clone(),
    ];
    args.extend(config.extra_flags.iter().cloned());

    if let Some(first) = spec.params.first() {
        if !first.starts_with("-params") {
            args.push("-params".to_string());
        }
        args.extend(spec.params.iter().cloned());
    }

    args
}

fn probe_pid(pid: u32) -> Result<bool> {
    let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
        return Ok(false);
    };

    // Signal 0 performs permission and existence checks without delivering anything.
    let rc = unsafe { libc::kill(raw_pid, 0) };
    if rc == 0 {
        return Ok(!is_zombie(pid));
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        Some(libc::EPERM) => Ok(!is_zombie(pid)),
        _ => Err(FleetError::process(
            format!("Failed to probe pid {}", pid),
            err,
        )),
    }
}

fn signal_terminate(pid: u32) -> Result<()> {
    let raw_pid = libc::pid_t::try_from(pid)
        .map_err(|err| FleetError::process(format!("Invalid pid {}", pid), err))?;

    let rc = unsafe { libc::kill(raw_pid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        warn!(pid, "Bot client already gone");
        return Ok(());
    }
    Err(FleetError::process(
        format!("Failed to signal pid {}", pid),
        err,
    ))
}

// kill(pid, 0) succeeds for zombies, so confirm state with a per-PID refresh.
fn is_zombie(pid: u32) -> bool {
    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid)
        .map(|process| matches!(process.status(), ProcessStatus::Zombie))
        .unwrap_or(false)
}

#[cfg(test)]
pub mod testing {
    //! Scripted process table for tests.

    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    pub struct FakeProcesses {
        state: Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        next_pid: u32,
        alive: HashSet<u32>,
        probe_failures: HashSet<u32>,
        fail_start: bool,
        launched: Vec<LaunchSpec>,
        stopped: Vec<u32>,
    }

    impl FakeProcesses {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(FakeState {
                    next_pid: 1000,
                    ..FakeState::default()
                }),
            }
        }

        fn state(&self) -> MutexGuard<'_, FakeState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub fn set_alive(&self, pid: u32) {
            self.state().alive.insert(pid);
        }

        pub fn kill(&self, pid: u32) {
            self.state().alive.remove(&pid);
        }

        pub fn fail_probe(&self, pid: u32) {
            self.state().probe_failures.insert(pid);
        }

        pub fn fail_next_start(&self) {
            self.state().fail_start = true;
        }

        pub fn launched(&self) -> Vec<LaunchSpec> {
            self.state().launched.clone()
        }

        pub fn stopped(&self) -> Vec<u32> {
            self.state().stopped.clone()
        }
    }

    impl ProcessHandle for FakeProcesses {
        fn start(&self, spec: &LaunchSpec) -> Result<u32> {
            let mut state = self.state();
            if std::mem::take(&mut state.fail_start) {
                return Err(FleetError::process("Failed to spawn client", "scripted failure"));
            }
            state.next_pid += 1;
            let pid = state.next_pid;
            state.alive.insert(pid);
            state.launched.push(spec.clone());
            Ok(pid)
        }

        fn stop(&self, pid: u32) -> Result<()> {
            let mut state = self.state();
            state.alive.remove(&pid);
            state.stopped.push(pid);
            Ok(())
        }

        fn is_alive(&self, pid: u32) -> Result<bool> {
            let state = self.state();
            if state.probe_failures.contains(&pid) {
                return Err(FleetError::process(
                    format!("Failed to probe pid {}", pid),
                    "scripted failure",
                ));
            }
            Ok(pid != 0 && state.alive.contains(&pid))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> ClientConfig {
        ClientConfig {
            java: "java".to_string(),
            client_jar: PathBuf::from("/opt/client/client.jar"),
            world: "f2p".to_string(),
            extra_flags: vec!["-covert".to_string(), "-fresh".to_string()],
        }
    }

    fn spec(params: &[&str]) -> LaunchSpec {
        LaunchSpec {
            email: "bot@example.com".to_string(),
            script: "chop.js".to_string(),
            params: params.iter().map(|value| value.to_string()).collect(),
        }
    }

    #[test]
    fn client_args_without_params() {
        let args = client_args(&config(), &spec(&[]));
        assert_eq!(
            args,
            vec![
                "-jar",
                "/opt/client/client.jar",
                "-account",
                "bot@example.com",
                "-script",
                "chop.js",
                "-world",
                "f2p",
                "-covert",
                "-fresh",
            ]
        );
    }

    #[test]
    fn client_args_insert_params_flag() {
        let args = client_args(&config(), &spec(&["oak", "bank"]));
        assert_eq!(&args[args.len() - 3..], &["-params", "oak", "bank"]);
    }

    #[test]
    fn client_args_keep_explicit_params_flag() {
        let args = client_args(&config(), &spec(&["-params", "oak"]));
        assert_eq!(args.iter().filter(|arg| *arg == "-params").count(), 1);
        assert_eq!(&args[args.len() - 2..], &["-params", "oak"]);
    }

    #[test]
    fn pid_zero_is_never_alive() {
        let launcher = ClientLauncher::new(config());
        assert!(!launcher.is_alive(0).expect("probe"));
        assert!(launcher.stop(0).is_ok());
    }

    #[test]
    fn current_process_is_alive() {
        let launcher = ClientLauncher::new(config());
        assert!(launcher.is_alive(std::process::id()).expect("probe self"));
    }

    #[test]
    fn reaped_child_reads_as_dead() {
        let child = Command::new("true")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn true");
        let pid = child.id();
        let launcher = ClientLauncher::new(config());
        launcher.children().insert(pid, child);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while launcher.is_alive(pid).expect("probe child") {
            assert!(
                std::time::Instant::now() < deadline,
                "child never exited"
            );
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!launcher.children().contains_key(&pid));
    }
}
