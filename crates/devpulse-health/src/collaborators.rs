//! Seams to the outside world: the service registry, container runtime,
//! and OS process table.

use async_trait::async_trait;

use devpulse_state::{RunStatus, ServiceEntry, StateResult, StateStore, StatusChange};

use crate::error::CheckError;
use crate::probe::{self, ExecOutput};

/// Authoritative store of service run state.
pub trait ServiceRegistry: Send + Sync {
    fn list_all(&self) -> StateResult<Vec<ServiceEntry>>;
    fn get_service(&self, name: &str) -> StateResult<Option<ServiceEntry>>;
    fn update_status(&self, name: &str, status: RunStatus) -> StateResult<()>;
    /// Read the current status and write `decide`'s answer atomically.
    fn transition_status(
        &self,
        name: &str,
        decide: &dyn Fn(RunStatus) -> Option<RunStatus>,
    ) -> StateResult<Option<StatusChange>>;
}

impl ServiceRegistry for StateStore {
    fn list_all(&self) -> StateResult<Vec<ServiceEntry>> {
        StateStore::list_all(self)
    }

    fn get_service(&self, name: &str) -> StateResult<Option<ServiceEntry>> {
        StateStore::get_service(self, name)
    }

    fn update_status(&self, name: &str, status: RunStatus) -> StateResult<()> {
        StateStore::update_status(self, name, status)
    }

    fn transition_status(
        &self,
        name: &str,
        decide: &dyn Fn(RunStatus) -> Option<RunStatus>,
    ) -> StateResult<Option<StatusChange>> {
        StateStore::transition_status(self, name, decide)
    }
}

/// Runs health-check commands inside containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn exec(&self, container: &str, args: &[String]) -> Result<ExecOutput, CheckError>;
    async fn exec_shell(&self, container: &str, command: &str) -> Result<ExecOutput, CheckError>;
}

/// `docker exec` through the CLI on PATH.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn exec(&self, container: &str, args: &[String]) -> Result<ExecOutput, CheckError> {
        let mut full = Vec::with_capacity(args.len() + 2);
        full.push("exec".to_string());
        full.push(container.to_string());
        full.extend(args.iter().cloned());
        probe::run_command(&self.binary, &full).await
    }

    async fn exec_shell(&self, container: &str, command: &str) -> Result<ExecOutput, CheckError> {
        let args = ["sh".to_string(), "-c".to_string(), command.to_string()];
        self.exec(container, &args).await
    }
}

/// Answers whether a PID is alive.
pub trait ProcessInspector: Send + Sync {
    fn is_running(&self, pid: u32) -> bool;
}

/// Signal-0 liveness check against the local process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

impl ProcessInspector for SystemProcesses {
    #[cfg(unix)]
    fn is_running(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // EPERM: alive, owned by someone else.
        match kill(Pid::from_raw(pid), None) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn is_running(&self, _pid: u32) -> bool {
        false
    }
}
