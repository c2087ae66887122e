use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cntest::config::DEFAULT_GROUP_FILE;
use cntest::runtime::{ContainerRuntime, DockerCli, ensure_available};
use cntest::{ContainerGroup, GroupFile, Settings, harness};

const USAGE: &str = "\
usage: cntest [up] [FILE]     start the group in FILE, wait for Enter, tear down
       cntest check [FILE]    validate FILE and print the startup order

FILE defaults to cntest-group.yaml. Settings are read from .cntest.yaml in
the current directory; CNTEST_DOCKER and CNTEST_MAX_START_SECS override them.";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Up(PathBuf),
    Check(PathBuf),
    Help,
}

impl Command {
    fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let args: Vec<String> = args.into_iter().collect();
        let mut rest = args.iter().map(String::as_str);
        let (verb, file) = match (rest.next(), rest.next(), rest.next()) {
            (None, _, _) => ("up", None),
            (Some("-h" | "--help" | "help"), _, _) => return Ok(Self::Help),
            (Some(verb @ ("up" | "check")), file, None) => (verb, file),
            (Some(file), None, _) if !file.starts_with('-') => ("up", Some(file)),
            _ => bail!("unexpected arguments: {}\n\n{USAGE}", args.join(" ")),
        };
        let file = PathBuf::from(file.unwrap_or(DEFAULT_GROUP_FILE));
        Ok(match verb {
            "check" => Self::Check(file),
            _ => Self::Up(file),
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cntest=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    match Command::parse(std::env::args().skip(1))? {
        Command::Help => {
            println!("{USAGE}");
            Ok(())
        }
        Command::Check(file) => check(&file),
        Command::Up(file) => up(&file),
    }
}

fn load(file: &Path) -> Result<GroupFile> {
    GroupFile::load(file).with_context(|| format!("Failed to load group file {}", file.display()))
}

fn check(file: &Path) -> Result<()> {
    let order = load(file)?.validate()?;
    for (i, name) in order.iter().enumerate() {
        println!("{:>2}. {name}", i + 1);
    }
    Ok(())
}

fn up(file: &Path) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let settings = Settings::resolve(&cwd)?;
    ensure_available(&settings.docker_binary)?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::with_binary(settings.docker_binary.as_str()));
    let group = load(file)?.build(runtime, &settings)?;
    if group.is_empty() {
        bail!("{} defines no containers", file.display());
    }

    // Chained dependencies start one after another, each with its own bound.
    let timeout = settings.max_start_time() * u32::try_from(group.len()).unwrap_or(u32::MAX);
    info!(containers = group.len(), ?timeout, stop_timeout = ?settings.stop_timeout(), "bringing up group");
    harness::run_with_group(&group, timeout, |group| {
        print_summary(group)?;
        wait_for_enter()
    })
}

fn print_summary(group: &ContainerGroup) -> Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{:<20} {:<36} {:<14} PORTS", "NAME", "IMAGE", "ID")?;
    for node in group.nodes() {
        let c = node.container();
        let id = c.id()?;
        let ports: Vec<String> = c
            .create_options()
            .port_bindings
            .iter()
            .map(|b| format!("{}->{}", b.host_port, b.container))
            .collect();
        writeln!(
            out,
            "{:<20} {:<36} {:<14} {}",
            node.name(),
            c.image(),
            &id[..id.len().min(12)],
            ports.join(", ")
        )?;
    }
    out.flush()?;
    Ok(())
}

fn wait_for_enter() -> Result<()> {
    print!("\nAll containers are ready. Press Enter to tear down. ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}
