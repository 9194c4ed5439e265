use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::ArgMatches;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tractor_agent::server::shutdown::wait_for_shutdown_signal;
use tractor_agent::{Agent, AgentClient, AgentError, Method, StatusChange, load_agent_config};
use tractor_core::notify::{func, observe};
use tractor_core::{Daemon, Registry};
use tractor_paths::TractorPaths;

pub(crate) fn handle_agent_command(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let user_dir = matches.get_one::<PathBuf>("path").cloned();
    match matches.subcommand() {
        Some(("call", sub)) => handle_call_command(sub, user_dir),
        Some(("list", sub)) => handle_list_command(sub, user_dir),
        None => handle_run_command(matches, user_dir),
        _ => Err("Unknown agent subcommand".into()),
    }
}

fn handle_run_command(
    matches: &ArgMatches,
    user_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let dev = matches.get_flag("dev");
    info!(event = "cli.agent.run_started", dev = dev);

    let agent = match Agent::open(user_dir) {
        Ok(agent) => Arc::new(agent),
        Err(e) => {
            eprintln!("Failed to open agent: {}", e);
            error!(event = "cli.agent.run_failed", error = %e);
            return Err(e.into());
        }
    };

    if dev && agent.socket_path().exists() {
        println!(
            "Agent socket already exists at {}, not starting another",
            agent.socket_path().display()
        );
        return Ok(());
    }

    for workspace in agent.workspaces() {
        observe(
            &workspace,
            func(|change: &StatusChange| {
                println!(
                    "{}: {} -> {}",
                    change.workspace, change.previous, change.current
                );
            }),
        );
    }

    let registry = Registry::new();
    registry.register(agent.clone())?;
    let daemon = Daemon::from_registry(&registry).with_shutdown_grace(agent.config().shutdown_grace());

    println!(
        "Agent listening on {} ({} workspaces)",
        agent.socket_path().display(),
        agent.workspaces().len()
    );

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let token = CancellationToken::new();
        let signal_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown_signal(signal_token).await {
                error!(
                    event = "cli.agent.signal_handler_failed",
                    error = %e,
                );
            }
        });
        daemon.run(token).await
    });

    match result {
        Ok(()) => {
            info!(event = "cli.agent.run_completed");
            Ok(())
        }
        Err(e) => {
            eprintln!("Agent failed: {}", e);
            error!(event = "cli.agent.run_failed", error = %e, code = e.error_code());
            Err(e.into())
        }
    }
}

/// Send names through unchanged; send existing paths canonicalised so they
/// match workspace targets.
fn call_argument(raw: &str) -> String {
    match Path::new(raw).canonicalize() {
        Ok(path) if raw.contains('/') || raw == "." => path.to_string_lossy().to_string(),
        _ => raw.to_string(),
    }
}

fn handle_call_command(
    matches: &ArgMatches,
    user_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some((method_name, sub)) = matches.subcommand() else {
        return Err("Missing call method".into());
    };
    let method: Method = method_name.parse()?;
    let raw = sub
        .get_one::<String>("workspace")
        .ok_or("Workspace argument is required")?;
    let target = call_argument(raw);

    let paths = TractorPaths::resolve_or(user_dir)?;
    let socket_path = load_agent_config(&paths)?.socket_path(&paths);

    info!(event = "cli.agent.call_started", method = %method, workspace = %target);
    let started = Instant::now();

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(call(&socket_path, method, &target));
    let elapsed = started.elapsed();

    match result {
        Ok(()) => {
            println!("{}(\"{}\") {:?}", method, target, elapsed);
            info!(event = "cli.agent.call_completed", method = %method);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            println!("{}(\"{}\") {:?}", method, target, elapsed);
            error!(
                event = "cli.agent.call_failed",
                method = %method,
                error = %e,
                code = e.error_code(),
            );
            Err(e.into())
        }
    }
}

async fn call(socket_path: &Path, method: Method, target: &str) -> Result<(), AgentError> {
    let mut client = AgentClient::connect(socket_path).await?;
    match method {
        Method::Start | Method::Stop => {
            let reply = client.call(method, target).await?;
            println!("REPLY => {}", reply);
        }
        Method::Connect => {
            let mut stream = client.connect_workspace(target).await?;
            println!("REPLY => {}", stream.reply().unwrap_or_default());
            let mut stdout = tokio::io::stdout();
            stream.copy_to(&mut stdout).await?;
        }
    }
    Ok(())
}

fn handle_list_command(
    matches: &ArgMatches,
    user_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let json = matches.get_flag("json");
    let agent = Agent::open(user_dir)?;
    let infos = agent.workspace_infos();

    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }

    if infos.is_empty() {
        println!(
            "No workspaces in {}",
            agent.paths().workspaces_dir().display()
        );
        return Ok(());
    }

    let width = infos.iter().map(|i| i.name.len()).max().unwrap_or(0);
    for info in &infos {
        println!(
            "{:<width$}  {:<19}  {}",
            info.name,
            info.status.to_string(),
            info.target.display(),
            width = width
        );
    }
    Ok(())
}
