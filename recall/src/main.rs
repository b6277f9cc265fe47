//! Ask questions of a live file tree without building an index.
//!
//! Reads `.recall/config.toml` from the current directory when present and
//! runs the default search pipeline once per invocation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use recall::core::state::State;
use recall::exit_codes;
use recall::io::config::{RecallConfig, config_path, load_config, write_config};
use recall::io::trace_export::write_trace;
use recall::pipeline::{RunStatus, ask, run_status};
use tracing::debug;

#[derive(Parser)]
#[command(
    name = "recall",
    version,
    about = "Self-healing search pipelines over live files"
)]
struct Cli {
    /// Config file (default: `.recall/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the search pipeline for one query and print the answer.
    Ask {
        /// Natural-language query.
        query: String,
        /// Directory to search (repeatable). Overrides `search.dirs`.
        #[arg(short, long = "dir")]
        dirs: Vec<PathBuf>,
        /// Print the execution trace to stderr.
        #[arg(long)]
        trace: bool,
        /// Also write the trace to a file: an HTML viewer for `.html`, JSON otherwise.
        #[arg(long, value_name = "PATH")]
        trace_out: Option<PathBuf>,
        /// Print the final state as JSON instead of the answer text.
        #[arg(long)]
        json: bool,
    },
    /// Write a default config file if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Validate the config and print it with defaults filled in.
    Config,
}

fn main() {
    recall::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let path = cli
        .config
        .unwrap_or_else(|| config_path(Path::new(".")));
    match cli.command {
        Command::Ask {
            query,
            dirs,
            trace,
            trace_out,
            json,
        } => cmd_ask(
            &path,
            &query,
            dirs,
            TraceOutput {
                stderr: trace,
                file: trace_out,
            },
            json,
        ),
        Command::Init { force } => cmd_init(&path, force),
        Command::Config => cmd_config(&path),
    }
}

struct TraceOutput {
    stderr: bool,
    file: Option<PathBuf>,
}

impl TraceOutput {
    fn emit(&self, query: &str, state: &State) -> Result<()> {
        if self.stderr {
            print_trace(state);
        }
        if let Some(file) = &self.file {
            write_trace(file, query, &state.trace)?;
        }
        Ok(())
    }
}

fn cmd_ask(path: &Path, query: &str, dirs: Vec<PathBuf>, trace: TraceOutput, json: bool) -> Result<i32> {
    let mut cfg = load_config(path)?;
    if !dirs.is_empty() {
        cfg.search.dirs = dirs;
    }
    debug!(dirs = ?cfg.search.dirs, "asking");

    match ask(&cfg, query)? {
        Ok(state) => {
            trace.emit(query, &state)?;
            print_state(&state, json)?;
            Ok(match run_status(&state) {
                RunStatus::Answered => exit_codes::OK,
                RunStatus::Degraded => exit_codes::DEGRADED,
            })
        }
        Err(failure) => {
            let (error, state) = failure.into_parts();
            trace.emit(query, &state)?;
            if json {
                print_state(&state, true)?;
            }
            eprintln!("recall failed: {error}");
            Ok(exit_codes::FAILED)
        }
    }
}

fn print_trace(state: &State) {
    for event in state.trace.iter() {
        eprintln!("{event}");
    }
}

fn print_state(state: &State, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(state).context("serialize state")?;
        println!("{out}");
    } else if let Some(answer) = &state.answer {
        println!("{answer}");
    } else {
        println!("(no answer)");
    }
    Ok(())
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        println!("{} exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(path, &RecallConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_config(path: &Path) -> Result<i32> {
    let cfg = load_config(path)?;
    let out = toml::to_string_pretty(&cfg).context("serialize config toml")?;
    print!("{out}");
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["recall", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["recall", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_ask_with_dirs_and_flags() {
        let cli = Cli::parse_from([
            "recall", "ask", "lease terms", "--dir", "docs", "-d", "notes", "--trace",
        ]);
        match cli.command {
            Command::Ask {
                query,
                dirs,
                trace,
                trace_out,
                json,
            } => {
                assert_eq!(query, "lease terms");
                assert_eq!(dirs, vec![PathBuf::from("docs"), PathBuf::from("notes")]);
                assert!(trace);
                assert_eq!(trace_out, None);
                assert!(!json);
            }
            _ => panic!("expected ask"),
        }
    }

    #[test]
    fn parse_ask_trace_out() {
        let cli = Cli::parse_from(["recall", "ask", "q", "--trace-out", "run.html"]);
        match cli.command {
            Command::Ask { trace, trace_out, .. } => {
                assert!(!trace);
                assert_eq!(trace_out, Some(PathBuf::from("run.html")));
            }
            _ => panic!("expected ask"),
        }
    }

    #[test]
    fn trace_output_writes_the_requested_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("trace.json");
        let mut state = State::new("lease terms");
        state.log("Grep", serde_json::json!({ "matches": 1 }));
        let output = TraceOutput {
            stderr: false,
            file: Some(file.clone()),
        };
        output.emit("lease terms", &state).expect("emit");
        let written = std::fs::read_to_string(&file).expect("read");
        assert!(written.contains("\"op\": \"Grep\""));
    }

    #[test]
    fn parse_global_config_flag() {
        let cli = Cli::parse_from(["recall", "config", "--config", "custom.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(cli.command, Command::Config));
    }

    #[test]
    fn init_writes_loadable_config_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = config_path(temp.path());
        assert_eq!(cmd_init(&path, false).expect("init"), exit_codes::OK);
        let written = std::fs::read_to_string(&path).expect("read");

        std::fs::write(&path, "[rank]\nmax_candidates = 7\n").expect("edit");
        cmd_init(&path, false).expect("init again");
        assert_eq!(load_config(&path).expect("load").rank.max_candidates, 7);

        cmd_init(&path, true).expect("force");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), written);
    }
}
