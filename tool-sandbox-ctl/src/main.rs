//! Tool sandbox CLI - run agent tools in per-call isolated environments

mod cli;
mod commands;
mod logging;
mod runner;

use clap::Parser;
use cli::{Cli, Commands};
use commands::{check_requirements, list_tools};
use console::style;
use runner::{RunConfig, run_tool};

fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose, cli.audit);

    match cli.command {
        Commands::Run {
            tool_id,
            tools,
            policy,
            principal,
            args,
            tier,
            timeout,
            memory,
            json,
        } => {
            let config = RunConfig {
                config: cli.config,
                tool_id,
                tools,
                policy,
                principal,
                args,
                tier,
                timeout,
                memory,
                json,
            };
            match run_tool(config) {
                Ok(code) => std::process::exit(code),
                Err(e) => {
                    eprintln!("{} {}", style("error:").red().bold(), e);
                    std::process::exit(2);
                }
            }
        }
        Commands::Check => check_requirements(),
        Commands::Tools { tools } => {
            if let Err(e) = list_tools(&tools) {
                eprintln!("{} {}", style("error:").red().bold(), e);
                std::process::exit(2);
            }
        }
    }
}
