use labfleet_cli::{parse_roster, Admin, AccessInfo, Settings};
use labfleet_core::{PlatformError, ResourceProfile};
use labfleet_test_utils::FakePlatform;
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn settings(access_dir: &std::path::Path) -> Settings {
    let mut settings = Settings::from_toml_str(
        r#"
        [provision]
        name_prefix = "lab-"
        max_attempts = 2
        "#,
    )
    .unwrap();
    settings.storage.access_dir = access_dir.to_path_buf();
    settings
}

#[tokio::test(start_paused = true)]
async fn roster_is_provisioned_with_per_row_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let platform = FakePlatform::new();
    let admin = Admin::new(Arc::<FakePlatform>::clone(&platform), &settings(dir.path())).unwrap();

    let roster = parse_roster(
        "student_id,enrolled_date,resource_limit\nalice,2024-09-01,high\nbob,2024-09-01,\ncarol,,high\n",
    )
    .unwrap();
    let report = admin.batch(roster, 2).await;

    assert!(report.is_success());
    let students: Vec<&str> = report.provisioned.iter().map(|(s, _)| s.as_str()).collect();
    assert_eq!(students, vec!["alice", "bob", "carol"]);
    assert_eq!(platform.create_count(), 3);

    let sizes: Vec<ResourceProfile> = {
        let mut machines = platform.live_machines();
        machines.sort_by(|a, b| a.name.cmp(&b.name));
        machines
            .iter()
            .map(|m| platform.machine(&m.id).unwrap().request.resources)
            .collect()
    };
    assert_eq!(
        sizes,
        vec![ResourceProfile::High, ResourceProfile::Standard, ResourceProfile::High]
    );

    let access: AccessInfo = serde_json::from_slice(
        &std::fs::read(dir.path().join("alice").join("access.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(access.url, report.provisioned[0].1);
}

#[tokio::test(start_paused = true)]
async fn one_failure_does_not_stop_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let platform = FakePlatform::new();
    platform.fail_next_create_with(PlatformError::Rejected {
        status: 422,
        message: "image not found".into(),
    });
    let admin = Admin::new(Arc::<FakePlatform>::clone(&platform), &settings(dir.path())).unwrap();

    let roster = parse_roster("alice\nbob\n").unwrap();
    let report = admin.batch(roster, 1).await;

    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0.as_str(), "alice");
    assert!(report.failed[0].1.contains("image not found"));
    assert_eq!(report.provisioned.len(), 1);
    assert!(!dir.path().join("alice").join("access.json").exists());
    assert!(dir.path().join("bob").join("access.json").exists());
}

#[tokio::test(start_paused = true)]
async fn provisioning_twice_adopts_the_running_machine() {
    let dir = tempfile::tempdir().unwrap();
    let platform = FakePlatform::new();
    let admin = Admin::new(Arc::<FakePlatform>::clone(&platform), &settings(dir.path())).unwrap();
    let alice = "alice".parse().unwrap();

    let (first, _) = admin.provision(&alice, ResourceProfile::Standard).await.unwrap();
    let (second, _) = admin.provision(&alice, ResourceProfile::Standard).await.unwrap();

    assert_eq!(first.machine_id, second.machine_id);
    assert_eq!(platform.create_count(), 1);
    assert!(first.name.starts_with("lab-"));
    assert_eq!(admin.list().await.unwrap().len(), 1);
}
