//! Testing utilities for labfleet workspace
//!
//! In-process stand-ins for the sandbox platform and the classroom, plus
//! fixtures that seed a store with exercises and answers.

#![allow(missing_docs)]

use async_trait::async_trait;
use labfleet_core::{
    ClassroomClient, ExecId, ExecOutput, ExecRequest, Fleet, FleetConfig, IntegrationError,
    MachineInfo, MachineRequest, MachineState, Platform, PlatformError, SandboxFile, ScoreReport,
};
use labfleet_workspace::{ExerciseId, MemoryStore, StudentId, WorkspacePath, WorkspaceStore};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What one `exec` call does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStep {
    /// Finish with this exit code
    Exit(i32),
    /// Sleep, then finish with this exit code
    Slow(Duration, i32),
    /// Never finish
    Hang,
    /// Kill the machine and fail with `MachineGone`
    Crash,
}

#[derive(Debug, Clone)]
pub struct FakeMachine {
    pub info: MachineInfo,
    pub request: MachineRequest,
    /// Files inside the sandbox, by workspace path
    pub files: BTreeMap<WorkspacePath, Vec<u8>>,
}

#[derive(Debug, Default)]
struct FakeState {
    machines: BTreeMap<String, FakeMachine>,
    next_id: u64,
    create_failures: VecDeque<PlatformError>,
    scripts: HashMap<String, VecDeque<ExecStep>>,
    exec_log: Vec<(String, Vec<String>)>,
    killed: Vec<ExecId>,
}

/// In-memory sandbox platform
///
/// Machine names are unique, like on the real platform. Every `exec` with
/// no script exits 0.
#[derive(Debug)]
pub struct FakePlatform {
    state: Mutex<FakeState>,
    boot_state: Mutex<MachineState>,
    create_delay: Mutex<Duration>,
    creates: AtomicUsize,
    destroys: AtomicUsize,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            boot_state: Mutex::new(MachineState::Started),
            create_delay: Mutex::new(Duration::ZERO),
            creates: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        }
    }
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` creates fail with a capacity error
    pub fn fail_next_creates(&self, n: usize) {
        let mut state = self.state.lock();
        for _ in 0..n {
            state
                .create_failures
                .push_back(PlatformError::Capacity("no capacity in region".into()));
        }
    }

    /// The next create fails with `err`
    pub fn fail_next_create_with(&self, err: PlatformError) {
        self.state.lock().create_failures.push_back(err);
    }

    /// State newly created machines start in
    pub fn set_boot_state(&self, state: MachineState) {
        *self.boot_state.lock() = state;
    }

    /// Delay between registering a machine and answering the create call
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    /// Steps for `command`; the last step repeats
    pub fn script(&self, command: &[&str], steps: Vec<ExecStep>) {
        self.state
            .lock()
            .scripts
            .insert(command.join(" "), steps.into());
    }

    /// Mark a machine failed, as if it crashed
    pub fn crash(&self, machine_id: &str) {
        if let Some(machine) = self.state.lock().machines.get_mut(machine_id) {
            machine.info.state = MachineState::Failed;
        }
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn destroy_count(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    /// Machines that exist and are not terminal
    pub fn live_machines(&self) -> Vec<MachineInfo> {
        self.state
            .lock()
            .machines
            .values()
            .filter(|m| !m.info.state.is_terminal())
            .map(|m| m.info.clone())
            .collect()
    }

    /// Every machine still registered, terminal or not
    pub fn machine_count(&self) -> usize {
        self.state.lock().machines.len()
    }

    pub fn machine(&self, machine_id: &str) -> Option<FakeMachine> {
        self.state.lock().machines.get(machine_id).cloned()
    }

    /// `(machine id, argv)` for every exec, in call order
    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().exec_log.clone()
    }

    pub fn killed_execs(&self) -> Vec<ExecId> {
        self.state.lock().killed.clone()
    }

    /// Files currently inside a machine
    pub fn sandbox_files(&self, machine_id: &str) -> BTreeMap<WorkspacePath, Vec<u8>> {
        self.state
            .lock()
            .machines
            .get(machine_id)
            .map(|m| m.files.clone())
            .unwrap_or_default()
    }

    /// Change a file inside a machine, as the student's notebook would
    pub fn edit_in_sandbox(&self, machine_id: &str, path: WorkspacePath, body: &[u8]) {
        if let Some(machine) = self.state.lock().machines.get_mut(machine_id) {
            machine.files.insert(path, body.to_vec());
        }
    }

    fn running_machine<'a>(
        state: &'a mut FakeState,
        machine_id: &str,
    ) -> Result<&'a mut FakeMachine, PlatformError> {
        state
            .machines
            .get_mut(machine_id)
            .filter(|m| m.info.state.is_running())
            .ok_or_else(|| PlatformError::MachineGone(machine_id.to_string()))
    }

    fn next_step(&self, command: &[String]) -> ExecStep {
        let mut state = self.state.lock();
        match state.scripts.get_mut(&command.join(" ")) {
            Some(steps) if steps.len() > 1 => steps.pop_front().unwrap_or(ExecStep::Exit(0)),
            Some(steps) => steps.front().cloned().unwrap_or(ExecStep::Exit(0)),
            None => ExecStep::Exit(0),
        }
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn find_by_name(&self, name: &str) -> Result<Option<MachineInfo>, PlatformError> {
        Ok(self
            .state
            .lock()
            .machines
            .values()
            .find(|m| m.info.name == name)
            .map(|m| m.info.clone()))
    }

    async fn create(&self, request: &MachineRequest) -> Result<MachineInfo, PlatformError> {
        let info = {
            let mut state = self.state.lock();
            if let Some(err) = state.create_failures.pop_front() {
                return Err(err);
            }
            if state.machines.values().any(|m| m.info.name == request.name) {
                return Err(PlatformError::Rejected {
                    status: 409,
                    message: format!("machine name {} already taken", request.name),
                });
            }
            state.next_id += 1;
            let info = MachineInfo {
                id: format!("fake-{:04}", state.next_id),
                name: request.name.clone(),
                state: *self.boot_state.lock(),
                url: format!("https://fake.sandbox/{}", request.name),
            };
            state.machines.insert(
                info.id.clone(),
                FakeMachine {
                    info: info.clone(),
                    request: request.clone(),
                    files: BTreeMap::new(),
                },
            );
            info
        };
        self.creates.fetch_add(1, Ordering::SeqCst);

        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(info)
    }

    async fn status(&self, machine_id: &str) -> Result<MachineState, PlatformError> {
        self.state
            .lock()
            .machines
            .get(machine_id)
            .map(|m| m.info.state)
            .ok_or_else(|| PlatformError::NotFound(machine_id.to_string()))
    }

    async fn start(&self, machine_id: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        let machine = state
            .machines
            .get_mut(machine_id)
            .ok_or_else(|| PlatformError::NotFound(machine_id.to_string()))?;
        machine.info.state = MachineState::Started;
        Ok(())
    }

    async fn stop(&self, machine_id: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        let machine = state
            .machines
            .get_mut(machine_id)
            .ok_or_else(|| PlatformError::NotFound(machine_id.to_string()))?;
        machine.info.state = MachineState::Stopped;
        Ok(())
    }

    async fn destroy(&self, machine_id: &str) -> Result<(), PlatformError> {
        if self.state.lock().machines.remove(machine_id).is_some() {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<MachineInfo>, PlatformError> {
        Ok(self
            .state
            .lock()
            .machines
            .values()
            .map(|m| m.info.clone())
            .collect())
    }

    async fn exec(
        &self,
        machine_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, PlatformError> {
        {
            let mut state = self.state.lock();
            state
                .exec_log
                .push((machine_id.to_string(), request.command.clone()));
            let running = state
                .machines
                .get(machine_id)
                .is_some_and(|m| m.info.state.is_running());
            if !running {
                return Err(PlatformError::MachineGone(machine_id.to_string()));
            }
        }

        let exit = |code: i32| ExecOutput {
            exit_code: code,
            stdout: String::new(),
            stderr: String::new(),
        };
        match self.next_step(&request.command) {
            ExecStep::Exit(code) => Ok(exit(code)),
            ExecStep::Slow(delay, code) => {
                tokio::time::sleep(delay).await;
                Ok(exit(code))
            }
            ExecStep::Hang => std::future::pending().await,
            ExecStep::Crash => {
                self.crash(machine_id);
                Err(PlatformError::MachineGone(machine_id.to_string()))
            }
        }
    }

    async fn kill_exec(&self, _machine_id: &str, exec_id: ExecId) -> Result<(), PlatformError> {
        self.state.lock().killed.push(exec_id);
        Ok(())
    }

    async fn put_files(&self, machine_id: &str, files: &[SandboxFile]) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        let machine = Self::running_machine(&mut state, machine_id)?;
        for file in files {
            machine.files.insert(file.path.clone(), file.body.clone());
        }
        Ok(())
    }

    async fn fetch_files(
        &self,
        machine_id: &str,
        dir: &WorkspacePath,
    ) -> Result<Vec<SandboxFile>, PlatformError> {
        let mut state = self.state.lock();
        let machine = Self::running_machine(&mut state, machine_id)?;
        Ok(machine
            .files
            .iter()
            .filter(|(path, _)| dir.contains(path))
            .map(|(path, body)| SandboxFile {
                path: path.clone(),
                body: body.clone(),
            })
            .collect())
    }
}

/// Classroom that records every report
#[derive(Debug, Default)]
pub struct RecordingClassroom {
    reports: Mutex<Vec<ScoreReport>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl RecordingClassroom {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse the next `n` deliveries
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn reports(&self) -> Vec<ScoreReport> {
        self.reports.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassroomClient for RecordingClassroom {
    async fn report(&self, report: &ScoreReport) -> Result<(), IntegrationError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(IntegrationError::Status {
                status: 503,
                message: "classroom unavailable".into(),
            });
        }
        self.reports.lock().push(report.clone());
        Ok(())
    }
}

pub fn student(id: &str) -> StudentId {
    StudentId::new(id).unwrap()
}

pub fn exercise(id: &str) -> ExerciseId {
    ExerciseId::new(id).unwrap()
}

pub fn path(p: &str) -> WorkspacePath {
    p.parse().unwrap()
}

/// Command used for check `name` in seeded exercises
pub fn check_command(name: &str) -> Vec<String> {
    vec!["pytest".to_string(), format!("test_{name}.py")]
}

/// Write `exercises/<id>/exercise.toml` with one check per name
pub async fn seed_exercise(
    store: &dyn WorkspaceStore,
    id: &str,
    checks: &[&str],
    timeout_secs: u64,
) {
    let mut manifest = format!("title = \"Exercise {id}\"\n\n[tests]\ntimeout_secs = {timeout_secs}\n");
    for name in checks {
        let argv = check_command(name)
            .iter()
            .map(|a| format!("\"{a}\""))
            .collect::<Vec<_>>()
            .join(", ");
        manifest.push_str(&format!(
            "\n[[tests.check]]\nname = \"{name}\"\ncommand = [{argv}]\n"
        ));
    }
    let dir = WorkspacePath::exercise(&exercise(id));
    store
        .write(&dir.child("exercise.toml").unwrap(), manifest.as_bytes())
        .await
        .unwrap();
    store
        .write(&dir.child("README.md").unwrap(), b"# instructions\n")
        .await
        .unwrap();
}

/// Write one answer file for `student`
pub async fn seed_answer(store: &dyn WorkspaceStore, student_id: &str, exercise_id: &str, file: &str, body: &[u8]) {
    let target = WorkspacePath::answer_for(&student(student_id), &exercise(exercise_id))
        .child(file)
        .unwrap();
    store.write(&target, body).await.unwrap();
}

/// Config with millisecond backoffs for paused-time tests
pub fn fast_config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.provision.base_backoff_ms = 10;
    config.provision.max_backoff_ms = 50;
    config.provision.poll_interval_ms = 5;
    config.provision.attempt_timeout_secs = 2;
    config.router.idle_timeout_secs = 60;
    config.router.reap_interval_secs = 10;
    config.reporting.flush_interval_secs = 1;
    config
}

/// A fleet wired to in-memory fakes
pub struct TestFleet {
    pub store: Arc<MemoryStore>,
    pub platform: Arc<FakePlatform>,
    pub classroom: Arc<RecordingClassroom>,
    pub fleet: Fleet,
}

impl TestFleet {
    pub fn new(config: FleetConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let platform = FakePlatform::new();
        let classroom = RecordingClassroom::new();
        let fleet = Fleet::new(
            config,
            Arc::clone(&store) as Arc<dyn WorkspaceStore>,
            Arc::clone(&platform) as Arc<dyn Platform>,
            Arc::clone(&classroom) as Arc<dyn ClassroomClient>,
        )
        .unwrap();
        Self {
            store,
            platform,
            classroom,
            fleet,
        }
    }

    /// Fleet with [`fast_config`] and exercise `ex1` seeded with `checks`
    pub async fn with_exercise(checks: &[&str], timeout_secs: u64) -> Self {
        let fixture = Self::new(fast_config());
        seed_exercise(fixture.store.as_ref(), "ex1", checks, timeout_secs).await;
        fixture
    }
}
