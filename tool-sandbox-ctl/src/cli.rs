use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tool-sandbox-ctl")]
#[command(version, about = "Run agent tools in per-call Linux sandboxes", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Run a registered tool with JSON arguments
    tool-sandbox-ctl run csv_report --tools ./tools --policy policy.json \\
        --principal agent-7 --args '{\"rows\": 10}'

    # Tighter limits and machine-readable output
    tool-sandbox-ctl run csv_report --tools ./tools --policy policy.json \\
        --timeout 5 --memory 64M --json

    # Inspect the host and the registry
    tool-sandbox-ctl check
    tool-sandbox-ctl tools --tools ./tools
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Engine configuration file (JSON); defaults apply when absent
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print every capability check
    #[arg(long, global = true)]
    pub audit: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute one tool request
    Run {
        /// Tool identifier as registered in the manifest directory
        tool_id: String,

        /// Directory of tool manifests (*.json)
        #[arg(short = 'T', long, value_name = "DIR")]
        tools: PathBuf,

        /// Capability policy file (JSON)
        #[arg(short, long, value_name = "FILE")]
        policy: PathBuf,

        /// Principal the request runs on behalf of
        #[arg(long, value_name = "ID", default_value = "cli")]
        principal: String,

        /// Tool arguments as a JSON object
        #[arg(short, long, value_name = "JSON", default_value = "{}")]
        args: String,

        /// Requested trust tier (baseline, elevated)
        #[arg(long, value_name = "TIER", default_value = "baseline")]
        tier: String,

        /// Wall-clock timeout in seconds
        #[arg(short, long, value_name = "SECONDS")]
        timeout: Option<u64>,

        /// Memory ceiling (64M, 1G)
        #[arg(short, long, value_name = "SIZE")]
        memory: Option<String>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check host support for sandboxing
    Check,

    /// List registered tools
    Tools {
        /// Directory of tool manifests (*.json)
        #[arg(short = 'T', long, value_name = "DIR")]
        tools: PathBuf,
    },
}
