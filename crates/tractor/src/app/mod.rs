mod agent;
mod global;


use clap::Command;

pub fn build_cli() -> Command {
    global::root_command().subcommand(agent::agent_command())
}
