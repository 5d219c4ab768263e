//! [`Platform`] over the Fly Machines REST API
//!
//! Every student gets one encrypted volume (`vol_<student>`) and one machine
//! named by the provisioner. Volumes outlive machines, so a replacement
//! sandbox finds the student's files where the previous one left them.
//!
//! Files move through the exec endpoint: small `python3` programs write
//! hex-encoded chunks under the volume mount and list a subtree back as JSON
//! lines, one file per line.

use crate::config::FlyConfig;
use crate::models::{
    volume_name, ApiError, CreateMachine, CreateVolume, ExecBody, ExecResponse, FetchedFile,
    Machine, Volume,
};
use async_trait::async_trait;
use labfleet_core::{
    ExecId, ExecOutput, ExecRequest, MachineInfo, MachineRequest, MachineState, Platform,
    PlatformError, SandboxFile,
};
use labfleet_workspace::WorkspacePath;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

/// Sent with every API request
pub const USER_AGENT: &str = concat!("labfleet-provision/", env!("CARGO_PKG_VERSION"));

/// Bytes written per exec call; hex doubles it, keeping one argument under
/// the kernel's 128 KiB limit
pub const PUT_CHUNK_BYTES: usize = 48 * 1024;

/// `python3 -c PUT_SCRIPT <file> <wb|ab> <hex>`
pub const PUT_SCRIPT: &str = "import os,sys
p=sys.argv[1]
os.makedirs(os.path.dirname(p),exist_ok=True)
with open(p,sys.argv[2]) as f:
    f.write(bytes.fromhex(sys.argv[3]))
";

/// `python3 -c FETCH_SCRIPT <mount> <subtree>`; hidden directories are skipped
pub const FETCH_SCRIPT: &str = "import json,os,sys
root=sys.argv[1]
for d,dirs,files in os.walk(os.path.join(root,sys.argv[2])):
    dirs[:]=[x for x in dirs if not x.startswith('.')]
    for n in files:
        p=os.path.join(d,n)
        if os.path.isfile(p) and not os.path.islink(p):
            with open(p,'rb') as f:
                print(json.dumps({'path':os.path.relpath(p,root),'hex':f.read().hex()}))
";

/// Fly Machines client
#[derive(Debug, Clone)]
pub struct FlyMachines {
    http: Client,
    base_url: String,
    config: FlyConfig,
}

impl FlyMachines {
    /// Client for `config`
    ///
    /// # Errors
    /// [`PlatformError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: FlyConfig) -> Result<Self, PlatformError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| PlatformError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: format!("{}/v1/apps/{}", config.api_base(), config.app_name),
            config,
        })
    }

    /// Configuration in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &FlyConfig {
        &self.config
    }

    /// Browser URL for `student`'s JupyterLab
    #[must_use]
    pub fn access_url(&self, student: &str) -> String {
        format!(
            "https://{}.{}/lab?token={}",
            self.config.app_name, self.config.base_domain, student
        )
    }

    /// Confirm the app exists and the token can see it
    ///
    /// # Errors
    /// [`PlatformError::NotFound`] for a missing app, otherwise the API error.
    pub async fn check_app(&self) -> Result<(), PlatformError> {
        self.send("get_app", self.request(Method::GET, "")).await?;
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.config.api_token)
    }

    async fn send(&self, op: &'static str, builder: RequestBuilder) -> Result<Response, PlatformError> {
        let started = Instant::now();
        let result = builder.send().await;
        metrics::histogram!("labfleet_fly_request_seconds", "op" => op)
            .record(started.elapsed().as_secs_f64());

        let response = result.map_err(|e| PlatformError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = match response.json::<ApiError>().await {
            Ok(body) if !body.error.is_empty() => body.error,
            _ => status.canonical_reason().unwrap_or("error").to_string(),
        };
        tracing::debug!(op, status = status.as_u16(), %message, "fly api error");
        Err(classify(status, message))
    }

    async fn json<T: DeserializeOwned>(
        &self,
        op: &'static str,
        builder: RequestBuilder,
    ) -> Result<T, PlatformError> {
        self.send(op, builder)
            .await?
            .json()
            .await
            .map_err(|e| PlatformError::Transport(format!("{op}: {e}")))
    }

    async fn list_machines(&self) -> Result<Vec<Machine>, PlatformError> {
        self.json("list_machines", self.request(Method::GET, "/machines"))
            .await
    }

    /// The student's volume, created on first use
    async fn ensure_volume(&self, student: &str) -> Result<Volume, PlatformError> {
        let name = volume_name(student);
        let volumes: Vec<Volume> = self
            .json("list_volumes", self.request(Method::GET, "/volumes"))
            .await?;
        if let Some(existing) = volumes.into_iter().find(|v| v.name == name && v.is_usable()) {
            tracing::debug!(volume = %existing.id, %name, "reusing student volume");
            return Ok(existing);
        }

        let body = CreateVolume {
            name: name.clone(),
            region: self.config.region.clone(),
            size_gb: self.config.volume_size_gb,
            encrypted: true,
        };
        let volume: Volume = self
            .json("create_volume", self.request(Method::POST, "/volumes").json(&body))
            .await?;
        tracing::info!(volume = %volume.id, %name, size_gb = body.size_gb, "student volume created");
        Ok(volume)
    }

    /// Run `command` on the machine through the exec endpoint
    async fn run(
        &self,
        machine_id: &str,
        command: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecOutput, PlatformError> {
        let body = ExecBody {
            command,
            timeout: timeout.as_secs().max(1),
        };
        let result: Result<ExecResponse, _> = self
            .json(
                "exec",
                self.request(Method::POST, &format!("/machines/{machine_id}/exec"))
                    .timeout(timeout + self.config.request_timeout())
                    .json(&body),
            )
            .await;
        match result {
            Ok(out) => Ok(ExecOutput {
                exit_code: out.exit_code,
                stdout: out.stdout,
                stderr: out.stderr,
            }),
            Err(PlatformError::NotFound(reason)) => Err(PlatformError::MachineGone(reason)),
            Err(PlatformError::Rejected { status: 412, message }) => {
                Err(PlatformError::MachineGone(message))
            }
            Err(e) => Err(e),
        }
    }

    /// Run a file transfer program; a non-zero exit is a transport failure
    async fn transfer(&self, machine_id: &str, command: Vec<String>) -> Result<String, PlatformError> {
        let out = self
            .run(machine_id, command, self.config.request_timeout())
            .await?;
        if !out.success() {
            return Err(PlatformError::Transport(format!(
                "file transfer exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }

    /// Absolute path of a workspace path inside the machine
    fn sandbox_path(&self, path: &WorkspacePath) -> String {
        format!("{}/{}", self.config.mount_path, path)
    }

    fn info(&self, machine: Machine) -> MachineInfo {
        let student = machine
            .student()
            .map(str::to_string)
            .unwrap_or_else(|| machine.name.clone());
        MachineInfo {
            url: self.access_url(&student),
            id: machine.id,
            name: machine.name,
            state: machine.state,
        }
    }
}

/// Map an API status onto the platform error taxonomy
fn classify(status: StatusCode, message: String) -> PlatformError {
    match status {
        StatusCode::NOT_FOUND => PlatformError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            PlatformError::Capacity(message)
        }
        s if s.is_client_error() => PlatformError::Rejected {
            status: s.as_u16(),
            message,
        },
        s => PlatformError::Transport(format!("{}: {message}", s.as_u16())),
    }
}

#[async_trait]
impl Platform for FlyMachines {
    async fn find_by_name(&self, name: &str) -> Result<Option<MachineInfo>, PlatformError> {
        let found = self
            .list_machines()
            .await?
            .into_iter()
            .find(|m| m.name == name && m.state != MachineState::Destroyed);
        Ok(found.map(|m| self.info(m)))
    }

    async fn create(&self, request: &MachineRequest) -> Result<MachineInfo, PlatformError> {
        let volume = self.ensure_volume(request.student.as_str()).await?;
        let body = CreateMachine::from_request(&self.config, request, &volume.id);
        let machine: Machine = self
            .json("create_machine", self.request(Method::POST, "/machines").json(&body))
            .await?;
        tracing::info!(
            machine = %machine.id,
            name = %request.name,
            student = %request.student,
            cpus = body.config.guest.cpus,
            memory_mb = body.config.guest.memory_mb,
            "fly machine created"
        );
        Ok(self.info(machine))
    }

    async fn status(&self, machine_id: &str) -> Result<MachineState, PlatformError> {
        let machine: Machine = self
            .json(
                "get_machine",
                self.request(Method::GET, &format!("/machines/{machine_id}")),
            )
            .await?;
        Ok(machine.state)
    }

    async fn start(&self, machine_id: &str) -> Result<(), PlatformError> {
        self.send(
            "start_machine",
            self.request(Method::POST, &format!("/machines/{machine_id}/start")),
        )
        .await?;
        Ok(())
    }

    async fn stop(&self, machine_id: &str) -> Result<(), PlatformError> {
        self.send(
            "stop_machine",
            self.request(Method::POST, &format!("/machines/{machine_id}/stop")),
        )
        .await?;
        Ok(())
    }

    async fn destroy(&self, machine_id: &str) -> Result<(), PlatformError> {
        let result = self
            .send(
                "destroy_machine",
                self.request(Method::DELETE, &format!("/machines/{machine_id}"))
                    .query(&[("force", "true")]),
            )
            .await;
        match result {
            Ok(_) | Err(PlatformError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> Result<Vec<MachineInfo>, PlatformError> {
        Ok(self
            .list_machines()
            .await?
            .into_iter()
            .map(|m| self.info(m))
            .collect())
    }

    async fn exec(&self, machine_id: &str, request: &ExecRequest) -> Result<ExecOutput, PlatformError> {
        let workdir = format!("{}/{}", self.config.mount_path, request.workdir);
        let mut command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "cd \"$0\" && exec \"$@\"".to_string(),
            workdir,
        ];
        command.extend(request.command.iter().cloned());
        self.run(machine_id, command, request.timeout).await
    }

    async fn kill_exec(&self, machine_id: &str, exec_id: ExecId) -> Result<(), PlatformError> {
        // The exec endpoint has no cancel; the request timeout already bounds
        // the command on the machine side.
        tracing::debug!(machine = %machine_id, exec = %exec_id, "fly exec abandoned");
        Ok(())
    }

    async fn put_files(&self, machine_id: &str, files: &[SandboxFile]) -> Result<(), PlatformError> {
        for file in files {
            let target = self.sandbox_path(&file.path);
            let mut chunks: Vec<&[u8]> = file.body.chunks(PUT_CHUNK_BYTES).collect();
            if chunks.is_empty() {
                chunks.push(&[]);
            }
            for (i, chunk) in chunks.into_iter().enumerate() {
                let mode = if i == 0 { "wb" } else { "ab" };
                self.transfer(machine_id, put_command(&target, mode, chunk))
                    .await?;
            }
        }
        tracing::debug!(machine = %machine_id, files = files.len(), "files written to machine");
        Ok(())
    }

    async fn fetch_files(
        &self,
        machine_id: &str,
        dir: &WorkspacePath,
    ) -> Result<Vec<SandboxFile>, PlatformError> {
        let command = vec![
            "python3".to_string(),
            "-c".to_string(),
            FETCH_SCRIPT.to_string(),
            self.config.mount_path.clone(),
            dir.to_string(),
        ];
        let stdout = self.transfer(machine_id, command).await?;
        parse_listing(&stdout)
    }
}

fn put_command(target: &str, mode: &str, chunk: &[u8]) -> Vec<String> {
    vec![
        "python3".to_string(),
        "-c".to_string(),
        PUT_SCRIPT.to_string(),
        target.to_string(),
        mode.to_string(),
        hex::encode(chunk),
    ]
}

/// Decode the JSON lines printed by [`FETCH_SCRIPT`]
///
/// Names that are not valid workspace paths are skipped.
fn parse_listing(stdout: &str) -> Result<Vec<SandboxFile>, PlatformError> {
    let mut files = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let fetched: FetchedFile = serde_json::from_str(line)
            .map_err(|e| PlatformError::Transport(format!("file listing: {e}")))?;
        let Ok(path) = fetched.path.parse::<WorkspacePath>() else {
            tracing::warn!(path = %fetched.path, "skipping file with an unsupported name");
            continue;
        };
        let body = hex::decode(&fetched.hex)
            .map_err(|e| PlatformError::Transport(format!("file listing {path}: {e}")))?;
        files.push(SandboxFile { path, body });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_platform_errors() {
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, "gone".into()),
            PlatformError::NotFound(_)
        ));
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, "slow down".into()).is_transient());
        assert!(classify(StatusCode::SERVICE_UNAVAILABLE, "no capacity".into()).is_transient());
        assert_eq!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, "bad image".into()),
            PlatformError::Rejected {
                status: 422,
                message: "bad image".into()
            }
        );
        assert!(classify(StatusCode::BAD_GATEWAY, "oops".into()).is_transient());
    }

    #[test]
    fn listing_lines_become_files() {
        let stdout = concat!(
            "{\"path\": \"answers/alice/ex1/main.py\", \"hex\": \"7072696e74283129\"}\n",
            "{\"path\": \"answers/alice/ex1/bad\\\\name\", \"hex\": \"\"}\n",
            "\n",
        );
        let files = parse_listing(stdout).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path.to_string(), "answers/alice/ex1/main.py");
        assert_eq!(files[0].body, b"print(1)");

        assert!(parse_listing("not json").is_err());
    }

    #[test]
    fn put_command_carries_hex_body() {
        let argv = put_command("/data/answers/alice/a.py", "wb", b"hi");
        assert_eq!(argv[0], "python3");
        assert_eq!(&argv[3..], ["/data/answers/alice/a.py", "wb", "6869"]);
    }

    #[test]
    fn access_url_points_at_lab() {
        let fly = FlyMachines::new(FlyConfig {
            app_name: "classroom".into(),
            base_domain: "fly.dev".into(),
            ..FlyConfig::default()
        })
        .unwrap();
        assert_eq!(fly.access_url("alice"), "https://classroom.fly.dev/lab?token=alice");
    }
}
