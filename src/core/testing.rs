/// In-memory fakes for the workload runtime and the process port

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::core::process::{CommandSpec, ProcessError, ProcessOutput, ProcessRunner};
use crate::core::runtime::{
    ExecRequest, InspectionError, RuntimeError, Workload, WorkloadRuntime,
};

#[derive(Debug, Clone)]
pub enum ExecBehavior {
    /// Exit 0 with this stdout
    Output(Vec<u8>),
    /// Exit 1 with this stderr
    Fail(String),
    /// Never finishes
    Hang,
}

#[derive(Default)]
pub struct FakeRuntime {
    workloads: Mutex<Vec<Workload>>,
    vanished: Mutex<HashSet<String>>,
    default_exec: Mutex<HashMap<String, ExecBehavior>>,
    scripted_exec: Mutex<HashMap<String, VecDeque<ExecBehavior>>>,
    requests: Mutex<Vec<(String, ExecRequest)>>,
}

impl FakeRuntime {
    pub fn with_workloads(workloads: Vec<Workload>) -> Self {
        let runtime = Self::default();
        *runtime.workloads.lock().unwrap() = workloads;
        runtime
    }

    /// Listed but gone by the time it is inspected
    pub fn vanish(&self, id: &str) {
        self.vanished.lock().unwrap().insert(id.to_string());
    }

    pub fn set_exec(&self, id: &str, behavior: ExecBehavior) {
        self.default_exec.lock().unwrap().insert(id.to_string(), behavior);
    }

    /// Behaviors consumed in order before falling back to `set_exec`
    pub fn set_exec_script(&self, id: &str, script: Vec<ExecBehavior>) {
        self.scripted_exec
            .lock()
            .unwrap()
            .insert(id.to_string(), script.into());
    }

    pub fn exec_count(&self, id: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, _)| target == id)
            .count()
    }

    pub fn requests(&self, id: &str) -> Vec<ExecRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, _)| target == id)
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn last_request(&self, id: &str) -> Option<ExecRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(target, _)| target == id)
            .map(|(_, request)| request.clone())
    }

    fn next_behavior(&self, id: &str, request: &ExecRequest) -> ExecBehavior {
        self.requests
            .lock()
            .unwrap()
            .push((id.to_string(), request.clone()));

        if let Some(script) = self.scripted_exec.lock().unwrap().get_mut(id) {
            if let Some(behavior) = script.pop_front() {
                return behavior;
            }
        }

        self.default_exec
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| ExecBehavior::Output(Vec::new()))
    }
}

#[async_trait]
impl WorkloadRuntime for FakeRuntime {
    async fn list_running(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(self
            .workloads
            .lock()
            .unwrap()
            .iter()
            .map(|w| w.id.clone())
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<Workload, InspectionError> {
        if self.vanished.lock().unwrap().contains(id) {
            return Err(InspectionError::Vanished { id: id.to_string() });
        }
        self.workloads
            .lock()
            .unwrap()
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or_else(|| InspectionError::Vanished { id: id.to_string() })
    }

    async fn exec_capture(
        &self,
        id: &str,
        request: &ExecRequest,
    ) -> Result<ProcessOutput, RuntimeError> {
        match self.next_behavior(id, request) {
            ExecBehavior::Output(stdout) => Ok(ProcessOutput {
                status: Some(0),
                stdout,
                stderr: Vec::new(),
            }),
            ExecBehavior::Fail(stderr) => Ok(ProcessOutput {
                status: Some(1),
                stdout: Vec::new(),
                stderr: stderr.into_bytes(),
            }),
            ExecBehavior::Hang => std::future::pending().await,
        }
    }

    async fn exec_to_file(
        &self,
        id: &str,
        request: &ExecRequest,
        dest: &Path,
    ) -> Result<ProcessOutput, RuntimeError> {
        match self.next_behavior(id, request) {
            ExecBehavior::Output(stdout) => {
                tokio::fs::write(dest, &stdout)
                    .await
                    .map_err(|source| RuntimeError::Io {
                        path: dest.display().to_string(),
                        source,
                    })?;
                Ok(ProcessOutput {
                    status: Some(0),
                    ..Default::default()
                })
            }
            ExecBehavior::Fail(stderr) => {
                // a failing client usually still creates the redirect target
                let _ = tokio::fs::write(dest, b"").await;
                Ok(ProcessOutput {
                    status: Some(1),
                    stdout: Vec::new(),
                    stderr: stderr.into_bytes(),
                })
            }
            ExecBehavior::Hang => std::future::pending().await,
        }
    }
}

type RunHook = Box<dyn Fn(&CommandSpec) + Send + Sync>;

/// Process runner that emulates `tar czf` and `docker run ... tar czf`
/// by writing a small file at the archive destination.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<CommandSpec>>,
    fail_when: Mutex<Vec<String>>,
    scripted: Mutex<VecDeque<ProcessOutput>>,
    hooks: Mutex<Vec<RunHook>>,
}

impl FakeRunner {
    /// Fail every command with an argument containing `needle`
    pub fn fail_when(&self, needle: &str) {
        self.fail_when.lock().unwrap().push(needle.to_string());
    }

    /// Outputs returned in order, ahead of archive emulation
    pub fn push_output(&self, output: ProcessOutput) {
        self.scripted.lock().unwrap().push_back(output);
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Side effect run against every command before it is answered
    pub fn on_run(&self, hook: impl Fn(&CommandSpec) + Send + Sync + 'static) {
        self.hooks.lock().unwrap().push(Box::new(hook));
    }

    /// Host side of a `-v <host>:/backup` mount
    pub fn backup_mount(spec: &CommandSpec) -> Option<PathBuf> {
        spec.args
            .iter()
            .find_map(|a| a.strip_suffix(":/backup"))
            .map(PathBuf::from)
    }

    /// Host path a tar invocation writes to
    fn archive_target(spec: &CommandSpec) -> Option<PathBuf> {
        let pos = spec.args.iter().position(|a| a == "czf")?;
        let target = spec.args.get(pos + 1)?;

        if let Some(file) = target.strip_prefix("/backup/") {
            // docker helper: find the host side of the /backup mount
            return Some(Self::backup_mount(spec)?.join(file));
        }
        Some(PathBuf::from(target))
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
        self.calls.lock().unwrap().push(spec.clone());
        for hook in self.hooks.lock().unwrap().iter() {
            hook(spec);
        }

        if let Some(output) = self.scripted.lock().unwrap().pop_front() {
            return Ok(output);
        }

        let failing = self
            .fail_when
            .lock()
            .unwrap()
            .iter()
            .any(|needle| spec.args.iter().any(|a| a.contains(needle.as_str())));
        if failing {
            return Ok(ProcessOutput {
                status: Some(2),
                stdout: Vec::new(),
                stderr: b"simulated failure".to_vec(),
            });
        }

        if let Some(target) = Self::archive_target(spec) {
            tokio::fs::write(&target, b"fake archive")
                .await
                .map_err(|source| ProcessError::Spawn {
                    program: spec.program.clone(),
                    source,
                })?;
        }

        Ok(ProcessOutput {
            status: Some(0),
            ..Default::default()
        })
    }
}
