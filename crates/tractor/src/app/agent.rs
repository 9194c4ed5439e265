use std::path::PathBuf;

use clap::{Arg, ArgAction, Command, value_parser};

fn workspace_arg() -> Arg {
    Arg::new("workspace")
        .help("Workspace name or target path")
        .required(true)
        .index(1)
}

pub fn agent_command() -> Command {
    Command::new("agent")
        .about("Run the workspace agent in the foreground, or call a running one")
        .arg(
            Arg::new("path")
                .long("path")
                .help("User data directory (default: ~/.tractor)")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("dev")
                .long("dev")
                .help("Exit quietly if an agent socket already exists")
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("call")
                .about("Make one call to the running agent")
                .subcommand_required(true)
                .arg_required_else_help(true)
                .subcommand(
                    Command::new("connect")
                        .about("Stream a workspace's output, starting it if needed")
                        .arg(workspace_arg()),
                )
                .subcommand(
                    Command::new("start")
                        .about("Start or restart a workspace")
                        .arg(workspace_arg()),
                )
                .subcommand(
                    Command::new("stop")
                        .about("Stop a workspace")
                        .arg(workspace_arg()),
                ),
        )
        .subcommand(
            Command::new("list").about("List configured workspaces").arg(
                Arg::new("json")
                    .long("json")
                    .help("Output as JSON")
                    .action(ArgAction::SetTrue),
            ),
        )
}
