mod cli;

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use cli::{Cli, Command};
use tau_bench::config::{ProjectConfig, resolve_executable};
use tau_bench::{ReplError, Submission, Workbench};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config);

    let filter = match cli.verbose {
        0 if is_config_command => "tau_bench=warn,taubench=warn",
        0 => "tau_bench=info,taubench=info",
        1 => "tau_bench=debug,taubench=debug",
        _ => "tau_bench=trace,taubench=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd =
        std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .taubench/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Run {
            timeout_secs,
            save_path,
        } => run_interactive(
            config,
            cli.tau_path.as_deref(),
            timeout_secs,
            save_path,
            &cwd,
        ),
        Command::Script {
            path,
            timeout_secs,
            log_out,
        } => run_script(
            config,
            cli.tau_path.as_deref(),
            &path,
            timeout_secs,
            log_out,
            &cwd,
        ),
        Command::Config => {
            let payload = serde_json::json!({
                "config": config,
                "source_path": config_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(defaults)".to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

fn resolve_or_bail(flag: Option<&str>, config: &ProjectConfig, cwd: &Path) -> Result<String> {
    resolve_executable(flag, config, cwd).context(
        "no tau executable found; pass --tau-path or set repl.executable in .taubench/config.toml",
    )
}

fn register_interrupt_handler(bench: &Workbench) {
    if let Some(session) = bench.session() {
        if let Err(e) = ctrlc::set_handler(move || session.interrupt()) {
            warn!("could not install Ctrl-C handler: {e}");
        }
    }
}

fn run_interactive(
    mut config: ProjectConfig,
    tau_path: Option<&str>,
    timeout_secs: Option<u64>,
    save_path: bool,
    cwd: &Path,
) -> Result<()> {
    let executable = resolve_or_bail(tau_path, &config, cwd)?;
    if save_path {
        let path = config.save_executable(cwd, &executable)?;
        info!("saved executable path to {}", path.display());
    }
    if let Some(secs) = timeout_secs {
        config.repl.submit_timeout_secs = secs;
    }

    let mut bench = Workbench::new(config);
    bench.start_session(&executable)?;
    register_interrupt_handler(&bench);

    let sentinel = bench
        .session()
        .map(|s| s.sentinel())
        .unwrap_or_default();
    info!(executable = %executable, sentinel = %sentinel, "session started");

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut line = String::new();
    loop {
        write!(stdout, "{sentinel} ")?;
        stdout.flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        match bench.submit(text) {
            Ok(Submission::Resolved(unit)) => println!("{}", unit.cleaned),
            Ok(Submission::Cleared) => {
                // Clear is local display state only.
                write!(stdout, "\x1b[2J\x1b[1;1H")?;
                stdout.flush()?;
            }
            Err(ReplError::ProcessDied) => {
                eprintln!("REPL process exited");
                break;
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }

    bench.terminate();
    Ok(())
}

fn run_script(
    mut config: ProjectConfig,
    tau_path: Option<&str>,
    script: &Path,
    timeout_secs: Option<u64>,
    log_out: Option<PathBuf>,
    cwd: &Path,
) -> Result<()> {
    let executable = resolve_or_bail(tau_path, &config, cwd)?;
    if let Some(secs) = timeout_secs {
        config.script.step_timeout_secs = secs;
    }

    let mut bench = Workbench::new(config);
    bench.start_session(&executable)?;
    register_interrupt_handler(&bench);
    bench
        .load_script(script)
        .with_context(|| format!("failed to load script {}", script.display()))?;

    let mut resolved = 0usize;
    let mut failed = 0usize;
    loop {
        match bench.step_next() {
            Ok(outcome) => {
                println!("[{}] {}", outcome.index + 1, outcome.line);
                match outcome.response {
                    Ok(Submission::Resolved(unit)) => {
                        resolved += 1;
                        println!("{}", unit.cleaned);
                    }
                    Ok(Submission::Cleared) => resolved += 1,
                    Err(e) => {
                        failed += 1;
                        eprintln!("error: {e}");
                    }
                }
            }
            Err(ReplError::EndOfScript) => break,
            Err(e) => return Err(e.into()),
        }
    }
    info!(resolved, failed, "script run finished");

    if let Some(path) = log_out {
        bench.log().export_jsonl(&path)?;
        info!("transaction log appended to {}", path.display());
    }

    bench.terminate();
    Ok(())
}
