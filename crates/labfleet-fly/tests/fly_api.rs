//! FlyMachines and HttpClassroom against a local fake of the remote APIs

use chrono::Utc;
use labfleet_core::{
    ClassroomClient, ExecRequest, Fleet, FleetConfig, GradingStatus, IntegrationError,
    MachineRequest, MachineState, Platform, PlatformError, ProvisionConfig, ResourceProfile,
    SandboxFile, SandboxProvisioner, ScoreReport, Submission, SubmissionEvent,
};
use labfleet_fly::{ClassroomConfig, FlyConfig, FlyMachines, HttpClassroom};
use labfleet_policy::{PolicyConfig, PolicyEngine};
use labfleet_test_utils::{exercise, path, seed_answer, seed_exercise, student, RecordingClassroom};
use labfleet_workspace::{ContentHash, FileEntry, MemoryStore, Snapshot, WorkspaceStore};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Reply};

#[derive(Default)]
struct FakeFly {
    next_id: usize,
    volumes: Vec<Value>,
    machines: Vec<Value>,
    create_bodies: Vec<Value>,
    exec_commands: Vec<Vec<String>>,
    /// Absolute path inside any machine -> body
    files: BTreeMap<String, Vec<u8>>,
    authorizations: Vec<String>,
    user_agents: Vec<String>,
    forced_deletes: usize,
    fail_creates_with: Option<u16>,
}

type Shared = Arc<Mutex<FakeFly>>;

fn api_error(code: u16, message: &str) -> Response {
    let status = StatusCode::from_u16(code).unwrap();
    warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status).into_response()
}

fn serve_fake_fly(state: &Shared) -> String {
    let with_state = {
        let state = Arc::clone(state);
        warp::any().map(move || Arc::clone(&state))
    };

    let list_volumes = warp::path!("v1" / "apps" / "classroom" / "volumes")
        .and(warp::get())
        .and(with_state.clone())
        .map(|s: Shared| warp::reply::json(&s.lock().volumes).into_response());

    let create_volume = warp::path!("v1" / "apps" / "classroom" / "volumes")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state.clone())
        .map(|body: Value, s: Shared| {
            let mut fly = s.lock();
            fly.next_id += 1;
            let volume = json!({
                "id": format!("vol_id{}", fly.next_id),
                "name": body["name"],
                "state": "created",
            });
            fly.volumes.push(volume.clone());
            warp::reply::json(&volume).into_response()
        });

    let list_machines = warp::path!("v1" / "apps" / "classroom" / "machines")
        .and(warp::get())
        .and(with_state.clone())
        .map(|s: Shared| warp::reply::json(&s.lock().machines).into_response());

    let create_machine = warp::path!("v1" / "apps" / "classroom" / "machines")
        .and(warp::post())
        .and(warp::header::<String>("authorization"))
        .and(warp::header::<String>("user-agent"))
        .and(warp::body::json())
        .and(with_state.clone())
        .map(|auth: String, agent: String, body: Value, s: Shared| {
            let mut fly = s.lock();
            fly.authorizations.push(auth);
            fly.user_agents.push(agent);
            if let Some(code) = fly.fail_creates_with {
                return api_error(code, "insufficient capacity");
            }
            fly.next_id += 1;
            let machine = json!({
                "id": format!("m{}", fly.next_id),
                "name": body["name"],
                "state": "started",
                "region": "ams",
                "config": body["config"],
            });
            fly.machines.push(machine.clone());
            fly.create_bodies.push(body);
            warp::reply::json(&machine).into_response()
        });

    let get_machine = warp::path!("v1" / "apps" / "classroom" / "machines" / String)
        .and(warp::get())
        .and(with_state.clone())
        .map(|id: String, s: Shared| {
            let fly = s.lock();
            match fly.machines.iter().find(|m| m["id"] == id.as_str()) {
                Some(machine) => warp::reply::json(machine).into_response(),
                None => api_error(404, "machine not found"),
            }
        });

    let delete_machine = warp::path!("v1" / "apps" / "classroom" / "machines" / String)
        .and(warp::delete())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_state.clone())
        .map(|id: String, query: HashMap<String, String>, s: Shared| {
            let mut fly = s.lock();
            if query.get("force").map(String::as_str) == Some("true") {
                fly.forced_deletes += 1;
            }
            let before = fly.machines.len();
            fly.machines.retain(|m| m["id"] != id.as_str());
            if fly.machines.len() == before {
                api_error(404, "machine not found")
            } else {
                warp::reply::json(&json!({ "ok": true })).into_response()
            }
        });

    let exec = warp::path!("v1" / "apps" / "classroom" / "machines" / String / "exec")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state)
        .map(|id: String, body: Value, s: Shared| {
            let mut fly = s.lock();
            if !fly.machines.iter().any(|m| m["id"] == id.as_str()) {
                return api_error(404, "machine not found");
            }
            let command: Vec<String> = serde_json::from_value(body["command"].clone()).unwrap();
            fly.exec_commands.push(command.clone());
            let stdout = match command.as_slice() {
                [py, _, _, target, mode, chunk] if py == "python3" => {
                    let bytes = hex::decode(chunk).unwrap();
                    let file = fly.files.entry(target.clone()).or_default();
                    if mode == "wb" {
                        file.clear();
                    }
                    file.extend(bytes);
                    String::new()
                }
                [py, _, _, root, sub] if py == "python3" => {
                    let base = format!("{root}/{sub}/");
                    fly.files
                        .iter()
                        .filter(|(name, _)| name.starts_with(&base))
                        .map(|(name, bytes)| {
                            json!({ "path": &name[root.len() + 1..], "hex": hex::encode(bytes) })
                                .to_string()
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                }
                _ => "ok".to_string(),
            };
            warp::reply::json(&json!({ "exit_code": 0, "stdout": stdout, "stderr": "" })).into_response()
        });

    let get_app = warp::path!("v1" / "apps" / "classroom")
        .and(warp::get())
        .map(|| warp::reply::json(&json!({ "name": "classroom", "status": "deployed" })).into_response());

    let routes = get_app
        .or(list_volumes)
        .or(create_volume)
        .or(list_machines)
        .or(create_machine)
        .or(get_machine)
        .or(delete_machine)
        .or(exec);
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    format!("http://{addr}")
}

fn fly_config(base: &str) -> FlyConfig {
    FlyConfig {
        base_domain: "fly.dev".into(),
        image: "jupyter:test".into(),
        ..FlyConfig::default()
            .with_api_host(base)
            .with_app("classroom")
            .with_token("test-token")
    }
}

fn request(name: &str, resources: ResourceProfile) -> MachineRequest {
    let who = name.trim_start_matches("jupyter-");
    MachineRequest {
        name: name.to_string(),
        student: student(who),
        mounts: Vec::new(),
        resources,
        env: BTreeMap::from([("STUDENT_ID".to_string(), who.to_string())]),
    }
}

#[tokio::test]
async fn machine_lifecycle_against_the_api() {
    let state = Shared::default();
    let fly = FlyMachines::new(fly_config(&serve_fake_fly(&state))).unwrap();

    let info = fly.create(&request("jupyter-alice", ResourceProfile::High)).await.unwrap();
    assert_eq!(info.name, "jupyter-alice");
    assert_eq!(info.state, MachineState::Started);
    assert_eq!(info.url, "https://classroom.fly.dev/lab?token=alice");

    {
        let fake = state.lock();
        assert_eq!(fake.volumes.len(), 1);
        assert_eq!(fake.volumes[0]["name"], "vol_alice");
        assert_eq!(fake.authorizations[0], "Bearer test-token");
        assert!(fake.user_agents[0].starts_with("labfleet-provision/"));
        let body = &fake.create_bodies[0];
        assert_eq!(body["config"]["guest"]["cpus"], 2);
        assert_eq!(body["config"]["mounts"][0]["volume"], fake.volumes[0]["id"]);
        assert_eq!(body["config"]["env"]["STUDENT_ID"], "alice");
    }

    let found = fly.find_by_name("jupyter-alice").await.unwrap();
    assert_eq!(found.map(|m| m.id), Some(info.id.clone()));
    assert_eq!(fly.find_by_name("jupyter-bob").await.unwrap(), None);
    assert_eq!(fly.status(&info.id).await.unwrap(), MachineState::Started);
    assert_eq!(fly.list().await.unwrap().len(), 1);

    fly.destroy(&info.id).await.unwrap();
    // Destroying twice is fine.
    fly.destroy(&info.id).await.unwrap();
    assert_eq!(state.lock().forced_deletes, 2);
    assert!(matches!(fly.status(&info.id).await, Err(PlatformError::NotFound(_))));
}

#[tokio::test]
async fn app_check_finds_only_the_configured_app() {
    let state = Shared::default();
    let base = serve_fake_fly(&state);
    FlyMachines::new(fly_config(&base)).unwrap().check_app().await.unwrap();

    let missing = FlyMachines::new(fly_config(&base).with_app("other")).unwrap();
    assert!(matches!(missing.check_app().await, Err(PlatformError::NotFound(_))));
}

#[tokio::test]
async fn replacement_machine_reuses_the_student_volume() {
    let state = Shared::default();
    let fly = FlyMachines::new(fly_config(&serve_fake_fly(&state))).unwrap();

    let first = fly.create(&request("jupyter-alice", ResourceProfile::Standard)).await.unwrap();
    fly.destroy(&first.id).await.unwrap();
    let second = fly.create(&request("jupyter-alice", ResourceProfile::Standard)).await.unwrap();

    assert_ne!(first.id, second.id);
    let fake = state.lock();
    assert_eq!(fake.volumes.len(), 1);
    assert_eq!(
        fake.create_bodies[0]["config"]["mounts"],
        fake.create_bodies[1]["config"]["mounts"]
    );
}

#[tokio::test]
async fn api_failures_are_classified() {
    let state = Shared::default();
    let fly = FlyMachines::new(fly_config(&serve_fake_fly(&state))).unwrap();

    state.lock().fail_creates_with = Some(503);
    let err = fly.create(&request("jupyter-alice", ResourceProfile::Standard)).await.unwrap_err();
    assert_eq!(err, PlatformError::Capacity("insufficient capacity".into()));

    state.lock().fail_creates_with = Some(422);
    let err = fly.create(&request("jupyter-alice", ResourceProfile::Standard)).await.unwrap_err();
    assert!(matches!(err, PlatformError::Rejected { status: 422, .. }));
}

#[tokio::test]
async fn exec_runs_in_the_mounted_workdir() {
    let state = Shared::default();
    let fly = FlyMachines::new(fly_config(&serve_fake_fly(&state))).unwrap();
    let info = fly.create(&request("jupyter-alice", ResourceProfile::Standard)).await.unwrap();

    let exec = ExecRequest::new(
        vec!["pytest".into(), "test_a.py".into()],
        path("answers/alice/ex1"),
        Duration::from_secs(30),
    );
    let output = fly.exec(&info.id, &exec).await.unwrap();
    assert!(output.success());
    assert_eq!(output.stdout, "ok");
    assert_eq!(
        state.lock().exec_commands[0],
        vec![
            "sh",
            "-c",
            "cd \"$0\" && exec \"$@\"",
            "/home/jovyan/student_data/answers/alice/ex1",
            "pytest",
            "test_a.py",
        ]
    );

    fly.destroy(&info.id).await.unwrap();
    let err = fly.exec(&info.id, &exec).await.unwrap_err();
    assert!(matches!(err, PlatformError::MachineGone(_)));
}

#[tokio::test]
async fn files_travel_through_exec_in_chunks() {
    let state = Shared::default();
    let fly = FlyMachines::new(fly_config(&serve_fake_fly(&state))).unwrap();
    let info = fly.create(&request("jupyter-alice", ResourceProfile::Standard)).await.unwrap();

    let big: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let files = vec![
        SandboxFile {
            path: path("answers/alice/ex1/data.bin"),
            body: big,
        },
        SandboxFile {
            path: path("answers/alice/ex1/empty.txt"),
            body: Vec::new(),
        },
    ];
    fly.put_files(&info.id, &files).await.unwrap();

    let modes: Vec<String> = state
        .lock()
        .exec_commands
        .iter()
        .map(|c| c[4].clone())
        .collect();
    assert_eq!(modes, vec!["wb", "ab", "ab", "wb"]);

    let fetched = fly.fetch_files(&info.id, &path("answers/alice")).await.unwrap();
    assert_eq!(fetched, files);
    assert!(fly.fetch_files(&info.id, &path("answers/bob")).await.unwrap().is_empty());
}

#[tokio::test]
async fn fleet_on_fly_moves_the_workspace_both_ways() {
    let state = Shared::default();
    let fly = Arc::new(FlyMachines::new(fly_config(&serve_fake_fly(&state))).unwrap());
    let store = Arc::new(MemoryStore::new());
    seed_exercise(store.as_ref(), "ex1", &["a"], 60).await;
    seed_answer(store.as_ref(), "alice", "ex1", "main.py", b"print(1)").await;
    let fleet = Fleet::new(
        FleetConfig::default(),
        Arc::clone(&store) as Arc<dyn WorkspaceStore>,
        fly as Arc<dyn Platform>,
        RecordingClassroom::new() as Arc<dyn ClassroomClient>,
    )
    .unwrap();

    let instance = fleet.open_session(&student("alice"), None).await.unwrap();
    let answer = "/home/jovyan/student_data/answers/alice/ex1/main.py";
    {
        let fake = state.lock();
        assert_eq!(
            fake.files["/home/jovyan/student_data/exercises/ex1/README.md"],
            b"# instructions\n"
        );
        assert!(fake
            .files
            .contains_key("/home/jovyan/student_data/exercises/ex1/exercise.toml"));
        assert_eq!(fake.files[answer], b"print(1)");
    }

    // The student edits the notebook inside the sandbox.
    state.lock().files.insert(answer.to_string(), b"print(2)".to_vec());

    let submission = fleet
        .grade_now(&SubmissionEvent::new(student("alice"), exercise("ex1")))
        .await
        .unwrap();
    assert_eq!(submission.sandbox(), Some(instance.id));
    assert_eq!(submission.snapshot().files[&path("main.py")], ContentHash::of(b"print(2)"));
    assert_eq!(
        store.read(&path("answers/alice/ex1/main.py")).await.unwrap(),
        b"print(2)"
    );
}

#[tokio::test]
async fn provisioner_brings_up_a_fly_sandbox() {
    let state = Shared::default();
    let fly = FlyMachines::new(fly_config(&serve_fake_fly(&state))).unwrap();
    let provisioner = SandboxProvisioner::new(
        Arc::new(fly),
        PolicyEngine::new(PolicyConfig::default()).unwrap(),
        ProvisionConfig::default(),
    );

    let instance = provisioner
        .provision(&student("alice"), ResourceProfile::Standard)
        .await
        .unwrap();
    assert_eq!(instance.name, "jupyter-alice");
    assert_eq!(instance.url, "https://classroom.fly.dev/lab?token=alice");

    let fake = state.lock();
    let env = &fake.create_bodies[0]["config"]["env"];
    assert_eq!(env["STUDENT_ID"], "alice");
    assert!(env["LABFLEET_GRANTS"].as_str().unwrap().contains("answers/alice"));
}

fn serve_classroom(received: &Arc<Mutex<Vec<Value>>>, status: StatusCode) -> String {
    let received = Arc::clone(received);
    let route = warp::path!("scores")
        .and(warp::post())
        .and(warp::body::json())
        .map(move |body: Value| {
            received.lock().push(body);
            warp::reply::with_status("", status)
        });
    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    format!("http://{addr}/scores")
}

fn report() -> ScoreReport {
    let submission = Submission::new(
        student("alice"),
        exercise("ex1"),
        Utc::now(),
        None,
        Snapshot::from_entries(path("answers/alice/ex1"), &Vec::<FileEntry>::new()).unwrap(),
        Vec::new(),
        GradingStatus::Completed,
    );
    ScoreReport::from(&submission)
}

#[tokio::test]
async fn classroom_receives_json_reports() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let classroom = HttpClassroom::new(ClassroomConfig {
        report_url: serve_classroom(&received, StatusCode::OK),
        token: Some("lms".into()),
        webhook_token: None,
    })
    .unwrap();

    classroom.report(&report()).await.unwrap();
    let bodies = received.lock();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["student_id"], "alice");
    assert_eq!(bodies[0]["exercise_id"], "ex1");
    assert_eq!(bodies[0]["status"], "completed");
}

#[tokio::test]
async fn classroom_errors_are_surfaced_for_retry() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let classroom = HttpClassroom::new(ClassroomConfig {
        report_url: serve_classroom(&received, StatusCode::INTERNAL_SERVER_ERROR),
        ..ClassroomConfig::default()
    })
    .unwrap();
    let err = classroom.report(&report()).await.unwrap_err();
    assert!(matches!(err, IntegrationError::Status { status: 500, .. }));

    let unconfigured = HttpClassroom::new(ClassroomConfig::default()).unwrap();
    assert!(matches!(
        unconfigured.report(&report()).await,
        Err(IntegrationError::Unreachable(_))
    ));
}
