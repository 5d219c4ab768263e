//! `labfleet` binary

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use labfleet_cli::{fly_platform, parse_roster, serve, Admin, Settings};
use labfleet_core::ResourceProfile;
use labfleet_policy::PolicyEngine;
use labfleet_workspace::StudentId;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn student_arg() -> Arg {
    Arg::new("student")
        .required(true)
        .value_parser(value_parser!(StudentId))
        .help("Student identifier")
}

fn cli() -> Command {
    Command::new("labfleet")
        .version(labfleet_core::VERSION)
        .about("Per-student JupyterLab sandboxes on Fly Machines")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Settings file (TOML)"),
        )
        .arg(
            Arg::new("env-file")
                .long("env-file")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("KEY=VALUE file applied over the environment"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log as JSON lines"),
        )
        .subcommand(Command::new("serve").about("Run the fleet and its HTTP API"))
        .subcommand(Command::new("list").about("List machines in the app"))
        .subcommand(
            Command::new("provision")
                .about("Provision one student's sandbox")
                .arg(student_arg())
                .arg(
                    Arg::new("resources")
                        .long("resources")
                        .value_parser(value_parser!(ResourceProfile))
                        .help("Machine size: standard or high"),
                ),
        )
        .subcommand(Command::new("stop").about("Stop a student's machine").arg(student_arg()))
        .subcommand(Command::new("start").about("Start a stopped machine").arg(student_arg()))
        .subcommand(
            Command::new("delete")
                .about("Destroy a student's machine")
                .arg(student_arg()),
        )
        .subcommand(
            Command::new("batch")
                .about("Provision every student in a roster CSV")
                .arg(
                    Arg::new("roster")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("student_id,enrolled_date,resource_limit"),
                )
                .arg(
                    Arg::new("parallel")
                        .long("parallel")
                        .default_value("4")
                        .value_parser(value_parser!(usize))
                        .help("Sandboxes provisioned at once"),
                ),
        )
        .subcommand(
            Command::new("grants")
                .about("Show the access grants a student's sandbox gets")
                .arg(student_arg()),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn student(args: &ArgMatches) -> anyhow::Result<StudentId> {
    args.get_one::<StudentId>("student")
        .cloned()
        .context("student is a required argument")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let settings = Settings::load(
        matches.get_one::<PathBuf>("config").map(PathBuf::as_path),
        matches.get_one::<PathBuf>("env-file").map(PathBuf::as_path),
    )
    .context("loading settings")?;

    let Some((name, args)) = matches.subcommand() else {
        return Ok(());
    };

    if name == "serve" {
        return serve(settings, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    }
    if name == "grants" {
        let grants = PolicyEngine::new(settings.fleet.policy.clone())?.grants_for(&student(args)?);
        for grant in grants.grants() {
            println!("{:<40} {}", grant.pattern, grant.mode);
        }
        return Ok(());
    }

    let admin = Admin::new(fly_platform(&settings).await?, &settings)?;
    match name {
        "list" => {
            let machines = admin.list().await?;
            if machines.is_empty() {
                println!("No machines");
            }
            for machine in machines {
                println!(
                    "{:<32} {:<16} {:<10} {}",
                    machine.name, machine.id, machine.state, machine.url
                );
            }
        }
        "provision" => {
            let student = student(args)?;
            let resources = args
                .get_one::<ResourceProfile>("resources")
                .copied()
                .unwrap_or(settings.fleet.provision.default_resources);
            let (instance, access) = admin.provision(&student, resources).await?;
            println!("Sandbox for {student}: {}", instance.url);
            println!("Access file: {}", access.display());
        }
        "stop" => {
            let machine = admin.stop(&student(args)?).await?;
            println!("Stopped {} ({})", machine.name, machine.id);
        }
        "start" => {
            let machine = admin.start(&student(args)?).await?;
            println!("Started {} ({})", machine.name, machine.id);
        }
        "delete" => {
            let machine = admin.delete(&student(args)?).await?;
            println!("Deleted {} ({})", machine.name, machine.id);
        }
        "batch" => {
            let path = args
                .get_one::<PathBuf>("roster")
                .context("roster is a required argument")?;
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let roster = match parse_roster(&text) {
                Ok(roster) => roster,
                Err(errors) => {
                    for error in &errors {
                        eprintln!("{error}");
                    }
                    anyhow::bail!("{} bad roster rows in {}", errors.len(), path.display());
                }
            };
            let parallel = args.get_one::<usize>("parallel").copied().unwrap_or(4);

            let report = admin.batch(roster, parallel).await;
            for (student, url) in &report.provisioned {
                println!("ok     {student:<24} {url}");
            }
            for (student, error) in &report.failed {
                println!("FAILED {student:<24} {error}");
            }
            println!(
                "{} provisioned, {} failed",
                report.provisioned.len(),
                report.failed.len()
            );
            if !report.is_success() {
                std::process::exit(1);
            }
        }
        _ => {}
    }
    Ok(())
}
