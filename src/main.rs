//! Sandbox Session Manager - Entry Point
//!
//! One binary, two personae: the launcher on the host, and the
//! `init-firewall` bootstrap running as the container's first process.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

use sandbox_session_manager::error::Error;
use sandbox_session_manager::firewall::{self, InitFirewallOptions};
use sandbox_session_manager::launch::{self, ConfigPaths, LaunchOptions};
use sandbox_session_manager::runtime::CliRuntime;
use sandbox_session_manager::session::default_data_root;

/// Sandbox Session Manager - session-aware container sandbox launcher.
#[derive(Parser, Debug)]
#[command(name = "ssm", author, version, about, long_about = None)]
struct Args {
    /// Agent version to run (a tag in the image repository)
    #[arg(long, value_name = "VERSION")]
    agent_version: Option<String>,

    /// Run the locally built sandbox image
    #[arg(long)]
    local: bool,

    /// Build the local sandbox image before launching
    #[arg(long)]
    build: bool,

    /// Set up the egress firewall inside the container
    #[arg(long)]
    with_firewall: bool,

    /// Skip display-socket mounts (no clipboard sharing)
    #[arg(long)]
    no_clipboard: bool,

    /// List this project's sessions and exit
    #[arg(long)]
    list_sessions: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Arguments forwarded verbatim to the contained agent (after `--`)
    #[arg(last = true, value_name = "AGENT_ARGS")]
    agent_args: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bootstrap the in-container firewall, then exec the given command
    InitFirewall {
        /// Path of the domain allow-list file
        #[arg(long, value_name = "FILE")]
        allow_list: PathBuf,

        /// Skip the post-setup reachability probes
        #[arg(long)]
        skip_probes: bool,

        /// Command to exec once the firewall stands (after `--`)
        #[arg(last = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
}

fn main() {
    let args = Args::parse();

    // Logs go to stderr; stdout belongs to the session and the listing table.
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(args) {
        Ok(code) => process::exit(code),
        Err(err) => {
            let code = err.exit_code();
            eprintln!("{:?}", miette::Report::new(err));
            process::exit(code);
        }
    }
}

fn run(args: Args) -> Result<i32, Error> {
    if let Some(Command::InitFirewall {
        allow_list,
        skip_probes,
        command,
    }) = args.command
    {
        firewall::init_firewall(&InitFirewallOptions {
            allow_list,
            skip_probes,
            command,
        })?;
        return Ok(0);
    }

    info!("Sandbox Session Manager v{}", env!("CARGO_PKG_VERSION"));

    let options = LaunchOptions {
        agent_version: args.agent_version,
        local: args.local,
        build: args.build,
        with_firewall: args.with_firewall,
        no_clipboard: args.no_clipboard,
        vertex_ai: launch::vertex_enabled(),
        agent_args: args.agent_args,
        workspace: launch::current_workspace()?,
        config: ConfigPaths::discover(),
        data_root: default_data_root(),
    };
    let runtime = CliRuntime::detect()?;

    if args.list_sessions {
        print!("{}", launch::list_sessions(&options, &runtime)?);
        return Ok(0);
    }

    launch::launch(&options, &runtime)
}
