//! n8n-provision entry point

use clap::Parser;
use n8n_provision::cli::{self, Cli, Session};
use n8n_provision::{InstallPaths, SystemHost, SystemInspector, TerminalOperator, console, process_guard};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Log to stderr, `RUST_LOG` overrides the default `info` level
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    init_tracing();
    if let Err(e) = process_guard::init_signal_handlers() {
        log::warn!("Failed to install signal handlers: {}", e);
    }

    let host = SystemHost::new(cli.dry_run);
    let operator = TerminalOperator;
    let inspector = SystemInspector;
    let helper_source = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("n8n-provision"));
    let session = Session {
        host: &host,
        operator: &operator,
        inspector: &inspector,
        base: InstallPaths::system(),
        helper_source,
    };

    if let Err(e) = cli::run(&cli, &session) {
        log::error!("{}", e);
        console::fail(&e.to_string());
        if e.is_side_effect_free() {
            console::hint("nothing on this host was changed");
        }
        std::process::exit(e.exit_code());
    }
}
