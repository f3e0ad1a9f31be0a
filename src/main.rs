mod cli;

use std::borrow::Cow;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use cli::{Cli, Command};
use ptywatch::classifier::{EventKind, ResultEvent};
use ptywatch::config::ProjectConfig;
use ptywatch::grouping::GroupMap;
use ptywatch::runner::{RunEvent, Runner};

fn symbol(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Pass => "✓",
        EventKind::Fail => "✗",
        EventKind::Error => "!",
        EventKind::Progress => "→",
    }
}

fn format_result(event: &ResultEvent, groups: &GroupMap) -> String {
    let mut line = format!("{} {}", symbol(event.kind), event.message);
    if let Some(display) = groups.lookup(&event.message) {
        line.push_str(&format!("  [{} / {}]", display.group, display.friendly_name));
    } else if let Some(group) = &event.group_key {
        line.push_str(&format!("  [{group}]"));
    }
    if event.amends_previous {
        line.push_str(" (amended)");
    }
    line
}

/// Rebuild the command line from the words clap already split, quoting each so
/// the shell sees the same words. A single word is taken as a full command
/// line and passed through untouched.
fn command_line(words: &[String]) -> String {
    match words {
        [line] => line.clone(),
        _ => words
            .iter()
            .map(|w| shell_escape::escape(Cow::Borrowed(w.as_str())))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn load_group_map(path: Option<&Path>) -> Result<GroupMap> {
    match path {
        Some(path) => GroupMap::load(path),
        None => Ok(GroupMap::default()),
    }
}

fn run(
    config: &ProjectConfig,
    command: &str,
    raw: bool,
    groups: GroupMap,
    forward_stdin: bool,
) -> Result<i32> {
    let runner = Arc::new(Runner::new(
        config.orchestrator_config(),
        config.pipeline_config(),
    ));

    {
        let runner = runner.clone();
        ctrlc::set_handler(move || {
            eprintln!("\x1b[33m[ptywatch]\x1b[0m interrupted, stopping script");
            runner.kill();
        })
        .context("failed to install Ctrl-C handler")?;
    }

    let events = runner
        .start(command)
        .with_context(|| format!("failed to start `{command}`"))?;

    if forward_stdin {
        let runner = runner.clone();
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if let Err(e) = runner.send_input(&format!("{line}\r")) {
                    warn!(error = %e, "failed to forward input");
                    break;
                }
            }
        });
    }

    let mut failures = 0usize;
    let mut exit_code = 0;
    for event in events {
        match event {
            RunEvent::Started { pid } => {
                info!(pid = ?pid, "running {command}");
            }
            RunEvent::Raw(chunk) => {
                if raw {
                    print!("{chunk}");
                }
            }
            RunEvent::Result(result) => {
                if matches!(result.kind, EventKind::Fail | EventKind::Error) {
                    failures += 1;
                }
                if result.kind == EventKind::Progress {
                    eprintln!("\x1b[36m[ptywatch]\x1b[0m {}", result.message);
                } else {
                    println!("{}", format_result(&result, &groups));
                }
            }
            RunEvent::Status(text) => {
                eprintln!("\x1b[36m[ptywatch]\x1b[0m {text}");
            }
            RunEvent::Exited(report) => {
                match report {
                    Some(report) => {
                        info!(code = report.code, killed = report.killed, "script finished");
                        exit_code = i32::try_from(report.code).unwrap_or(1);
                    }
                    None => {
                        warn!("script exit status unavailable");
                        exit_code = 1;
                    }
                }
                break;
            }
        }
    }

    if failures > 0 {
        eprintln!("\x1b[31m[ptywatch]\x1b[0m {failures} failing result(s)");
        if exit_code == 0 {
            exit_code = 1;
        }
    }
    Ok(exit_code)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "ptywatch=warn",
        0 => "ptywatch=info",
        1 => "ptywatch=debug",
        _ => "ptywatch=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd =
        std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .ptywatch/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Run {
            raw,
            group_map,
            no_stdin,
            command,
        } => {
            let map_path = group_map.or_else(|| config.display.group_map.clone());
            let groups = load_group_map(map_path.as_deref())?;
            let code = run(&config, &command_line(&command), raw, groups, !no_stdin)?;
            std::process::exit(code);
        }
        Command::Config { json } => {
            if json {
                let out = serde_json::to_string_pretty(&config)
                    .context("failed to serialize config to JSON")?;
                println!("{out}");
            } else {
                let out = toml::to_string_pretty(&config)
                    .context("failed to serialize config to TOML")?;
                let source = config_path
                    .as_deref()
                    .map_or_else(|| "defaults".to_string(), |p| p.display().to_string());
                println!("# source: {source}");
                print!("{out}");
            }
        }
    }

    Ok(())
}
