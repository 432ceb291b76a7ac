use crate::{TargetArgs, WaitArgs};
use anyhow::{Context, bail};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::info;
use vmwait_core::{
    CustomizationMarker, DEFAULT_POLL_INTERVAL_SECS, IdentitySource, PollInterval, PowerController,
    PowerOutcome, StartOptions, WaitLimit, WaitOptions, WaitOutcome,
};
use vmwait_qemu::{QemuControlPlane, ServerRegistry, Settings, VmwaitDirs};

pub async fn stop(target: &TargetArgs, wait: &WaitArgs) -> anyhow::Result<()> {
    let (settings, plane) = load_plane()?;
    let options = wait_options(wait, &settings)?;
    let controller = PowerController::new(&plane, &plane, &plane);

    let mut sources = identity_sources(target, &settings, BufReader::new(tokio::io::stdin()))?;
    while let Some(source) = sources.next().await? {
        let label = describe(&source);
        let outcome = controller
            .stop_and_wait(source, &options)
            .await
            .with_context(|| format!("Failed to stop {label}"))?;
        report(outcome, wait.pass_thru, &mut std::io::stdout().lock())?;
    }

    Ok(())
}

pub async fn start(
    target: &TargetArgs,
    wait: &WaitArgs,
    wait_for_ip: bool,
    wait_for_customization: bool,
) -> anyhow::Result<()> {
    let (settings, plane) = load_plane()?;
    let options = StartOptions {
        wait: wait_options(wait, &settings)?,
        wait_for_ip,
        wait_for_customization,
    };
    let controller = PowerController::new(&plane, &plane, &plane);

    let mut sources = identity_sources(target, &settings, BufReader::new(tokio::io::stdin()))?;
    while let Some(source) = sources.next().await? {
        let label = describe(&source);
        let outcome = controller
            .start_and_wait(source, &options)
            .await
            .with_context(|| format!("Failed to start {label}"))?;
        report(outcome, wait.pass_thru, &mut std::io::stdout().lock())?;
    }

    Ok(())
}

fn load_plane() -> anyhow::Result<(Settings, QemuControlPlane)> {
    let dirs = VmwaitDirs::new()?;
    let settings_file = dirs.settings_file();
    let settings = Settings::load(&settings_file)
        .with_context(|| format!("Failed to load {}", settings_file.display()))?;

    let plane = control_plane(&settings, dirs.servers_dir());
    Ok((settings, plane))
}

fn control_plane(settings: &Settings, default_servers_dir: PathBuf) -> QemuControlPlane {
    let servers_dir = settings
        .servers_dir
        .clone()
        .unwrap_or(default_servers_dir);
    let mut plane = QemuControlPlane::new(ServerRegistry::new(servers_dir));
    if let Some(marker) = &settings.customization_marker {
        plane = plane.with_marker(CustomizationMarker::new(marker.clone()));
    }
    if let Some(secs) = settings.qmp_timeout {
        plane = plane.with_qmp_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = settings.agent_timeout {
        plane = plane.with_agent_timeout(Duration::from_secs(secs));
    }
    plane
}

/// Flags win over settings, settings win over built-in defaults.
fn wait_options(wait: &WaitArgs, settings: &Settings) -> anyhow::Result<WaitOptions> {
    let secs = wait
        .interval
        .or(settings.poll_interval)
        .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
    let interval = PollInterval::from_secs(secs)?;

    let limit = wait
        .timeout
        .or(settings.timeout)
        .map_or(WaitLimit::Unbounded, |secs| {
            WaitLimit::Duration(Duration::from_secs(secs))
        });

    let probe_policy = wait
        .probe_policy
        .map(Into::into)
        .or(settings.probe_policy)
        .unwrap_or_default();

    Ok(WaitOptions {
        interval,
        limit,
        probe_policy,
    })
}

/// VMs to act on, handed out one at a time. Piped handles are read as they
/// arrive so each VM is handled before the next line is read.
enum Sources<R> {
    Single(Option<IdentitySource>),
    Piped(Lines<R>),
}

impl<R: AsyncBufRead + Unpin> Sources<R> {
    async fn next(&mut self) -> anyhow::Result<Option<IdentitySource>> {
        match self {
            Sources::Single(source) => Ok(source.take()),
            Sources::Piped(lines) => loop {
                let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
                    return Ok(None);
                };
                if !line.trim().is_empty() {
                    return Ok(Some(IdentitySource::Piped(line)));
                }
            },
        }
    }
}

fn identity_sources<R: AsyncBufRead + Unpin>(
    target: &TargetArgs,
    settings: &Settings,
    input: R,
) -> anyhow::Result<Sources<R>> {
    if target.from_stdin {
        return Ok(Sources::Piped(input.lines()));
    }
    Ok(Sources::Single(Some(named_source(target, settings)?)))
}

fn named_source(target: &TargetArgs, settings: &Settings) -> anyhow::Result<IdentitySource> {
    if let Some(handle) = &target.handle {
        return Ok(IdentitySource::Piped(handle.clone()));
    }

    let Some(name) = &target.name else {
        bail!("A VM name, --handle, or --from-stdin is required");
    };
    let Some(server) = target
        .server
        .as_ref()
        .or(settings.default_server.as_ref())
    else {
        bail!("No server given: pass --server or set default_server in settings.hcl");
    };

    Ok(IdentitySource::by_name(name.clone(), server.clone()))
}

fn describe(source: &IdentitySource) -> String {
    match source {
        IdentitySource::ByName { name, server } => format!("'{name}' on {server}"),
        IdentitySource::ByHandle(vm) => vm.handle(),
        IdentitySource::Piped(handle) => handle.trim().to_string(),
    }
}

fn report(outcome: PowerOutcome, pass_thru: bool, out: &mut impl Write) -> anyhow::Result<()> {
    let outcome = match outcome {
        PowerOutcome::Reached(outcome) => {
            info!(
                "{} is {} after {}s",
                outcome.vm,
                outcome.final_state,
                outcome.elapsed.as_secs()
            );
            outcome
        }
        PowerOutcome::AlreadyInState { vm, state } => WaitOutcome {
            final_state: state,
            elapsed: Duration::ZERO,
            polls: 1,
            satisfied: BTreeSet::new(),
            guest_ip: None,
            vm,
        },
    };

    if pass_thru {
        writeln!(out, "{}", serde_json::to_string(&outcome)?)?;
    }
    Ok(())
}
