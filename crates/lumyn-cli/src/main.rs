//! Lumyn CLI: decide requests, export decision packs, replay and explain them.

#![deny(unsafe_code)]

mod pack;

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use engine::{DecisionRecord, EngineConfig};
use lumyn_core::canon::canonical_json;
use store::{SqliteStore, Store};

const DEFAULT_POLICY_TEMPLATE: &str = include_str!("../../../policies/lumyn-support.v0.yml");

#[derive(Parser, Debug)]
#[command(name = "lumyn", about = "Lumyn policy decision engine CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the engine version
    Version,
    /// Initialize a workspace: policy template plus store
    Init {
        #[arg(long, default_value = ".lumyn")]
        workspace: PathBuf,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Decide a request file against the workspace policy and store
    Decide {
        #[arg(long = "in")]
        input: PathBuf,
        #[arg(long, default_value = ".lumyn")]
        workspace: PathBuf,
    },
    /// Export a stored decision record, optionally as a replayable pack
    Export {
        decision_id: String,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = false)]
        pack: bool,
        #[arg(long, default_value = ".lumyn")]
        workspace: PathBuf,
    },
    /// Validate a decision pack: recompute hashes and compare to the record
    Replay {
        pack: PathBuf,
        #[arg(long, default_value_t = false)]
        markdown: bool,
    },
    /// Explain a stored decision record in human-readable form
    Explain {
        decision_id: String,
        #[arg(long, default_value = ".lumyn")]
        workspace: PathBuf,
        #[arg(long, default_value_t = false)]
        markdown: bool,
    },
}

/// CLI failure; rendered as a one-line stderr message with exit code 1.
#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Msg(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Engine(#[from] engine::EngineError),
    #[error(transparent)]
    Policy(#[from] policy::PolicyError),
    #[error(transparent)]
    Store(#[from] store::StoreError),
}

fn die(msg: impl Into<String>) -> CliError {
    CliError::Msg(msg.into())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.cmd {
        Command::Version => println!("{}", lumyn_core::VERSION),
        Command::Init { workspace, force } => {
            let paths = cmd_init(&workspace, force)?;
            println!("initialized workspace at {}", paths.workspace.display());
        }
        Command::Decide { input, workspace } => {
            let record = cmd_decide(&input, &workspace)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Export { decision_id, out, pack: as_pack, workspace } => {
            cmd_export(&decision_id, &out, as_pack, &workspace)?;
            println!("wrote {}", out.display());
        }
        Command::Replay { pack: pack_path, markdown } => {
            let outcome = pack::replay_pack(&pack_path)?;
            print!("{}", render_replay(&outcome, markdown));
        }
        Command::Explain { decision_id, workspace, markdown } => {
            let record = load_record(&decision_id, &workspace)?;
            print!("{}", render_explain(&record, markdown));
        }
    }
    Ok(())
}

#[derive(Debug)]
struct WorkspacePaths {
    workspace: PathBuf,
    db_path: PathBuf,
    policy_path: PathBuf,
}

fn resolve_workspace(workspace: &Path) -> WorkspacePaths {
    WorkspacePaths {
        workspace: workspace.to_path_buf(),
        db_path: workspace.join("lumyn.db"),
        policy_path: workspace.join("policy.v0.yml"),
    }
}

/// Create whatever is missing: directory, policy template, store schema.
fn ensure_workspace(paths: &WorkspacePaths) -> Result<(), CliError> {
    fs::create_dir_all(&paths.workspace)?;
    if !paths.policy_path.exists() {
        fs::write(&paths.policy_path, DEFAULT_POLICY_TEMPLATE)?;
    }
    let store = SqliteStore::open(&paths.db_path)?;
    store.init()?;
    Ok(())
}

fn cmd_init(workspace: &Path, force: bool) -> Result<WorkspacePaths, CliError> {
    let paths = resolve_workspace(workspace);
    if paths.policy_path.exists() && !force {
        return Err(die(format!(
            "workspace already initialized at {} (use --force to overwrite the policy)",
            paths.workspace.display()
        )));
    }
    if force && paths.policy_path.exists() {
        fs::remove_file(&paths.policy_path)?;
    }
    ensure_workspace(&paths)?;
    Ok(paths)
}

fn cmd_decide(input: &Path, workspace: &Path) -> Result<DecisionRecord, CliError> {
    let paths = resolve_workspace(workspace);
    ensure_workspace(&paths)?;
    let raw = fs::read_to_string(input)
        .map_err(|e| die(format!("request file {}: {e}", input.display())))?;
    let request: Value =
        serde_json::from_str(&raw).map_err(|e| die(format!("request file is not json: {e}")))?;
    let store = SqliteStore::open(&paths.db_path)?;
    let config = EngineConfig { policy_path: paths.policy_path, ..Default::default() };
    Ok(engine::decide(&request, &config, &store)?)
}

fn cmd_export(
    decision_id: &str,
    out: &Path,
    as_pack: bool,
    workspace: &Path,
) -> Result<(), CliError> {
    let record = load_record(decision_id, workspace)?;
    if as_pack {
        let paths = resolve_workspace(workspace);
        let store = SqliteStore::open(&paths.db_path)?;
        store.init()?;
        let hash =
            record.pointer("/policy/policy_hash").and_then(Value::as_str).unwrap_or_default();
        let policy_text = store
            .get_policy_snapshot_text(hash)?
            .ok_or_else(|| die(format!("policy snapshot not found: {hash}")))?;
        pack::write_pack(out, &record, &policy_text)?;
    } else {
        fs::write(out, canonical_json(&record))?;
    }
    Ok(())
}

fn load_record(decision_id: &str, workspace: &Path) -> Result<Value, CliError> {
    let paths = resolve_workspace(workspace);
    ensure_workspace(&paths)?;
    let store = SqliteStore::open(&paths.db_path)?;
    store
        .get_decision_record(decision_id)?
        .ok_or_else(|| die(format!("decision not found: {decision_id}")))
}

fn render_replay(outcome: &pack::ReplayOutcome, markdown: bool) -> String {
    let reasons = if outcome.reason_codes.is_empty() {
        "(none)".to_owned()
    } else {
        outcome.reason_codes.join(", ")
    };
    if markdown {
        format!(
            "# Lumyn decision `{}`\n\
             - verdict: `{}`\n\
             - reason_codes: `{}`\n\
             - policy_hash: `{}`\n\
             - context_digest: `{}`\n\
             - inputs_digest: `{}`\n",
            outcome.decision_id,
            outcome.verdict,
            reasons,
            outcome.policy_hash,
            outcome.context_digest,
            outcome.inputs_digest,
        )
    } else {
        format!(
            "ok\ndecision_id: {}\nverdict: {}\npolicy_hash: {}\ncontext_digest: {}\ninputs_digest: {}\n",
            outcome.decision_id,
            outcome.verdict,
            outcome.policy_hash,
            outcome.context_digest,
            outcome.inputs_digest,
        )
    }
}

fn render_explain(record: &Value, markdown: bool) -> String {
    let field = |ptr: &str| record.pointer(ptr).and_then(Value::as_str).unwrap_or_default();
    let reason_codes: Vec<&str> = record
        .pointer("/evaluation/reason_codes")
        .and_then(Value::as_array)
        .map(|codes| codes.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let reasons =
        if reason_codes.is_empty() { "(none)".to_owned() } else { reason_codes.join(", ") };
    let empty = Vec::new();
    let matched = record
        .pointer("/evaluation/matched_rules")
        .and_then(Value::as_array)
        .unwrap_or(&empty);

    let mut out = String::new();
    if markdown {
        out.push_str(&format!(
            "# Lumyn decision `{}`\n\
             - created_at: `{}`\n\
             - verdict: `{}`\n\
             - reason_codes: `{}`\n\
             - policy_hash: `{}`\n\
             - context_digest: `{}`\n\
             - inputs_digest: `{}`\n",
            field("/decision_id"),
            field("/created_at"),
            field("/evaluation/verdict"),
            reasons,
            field("/policy/policy_hash"),
            field("/request/context/digest"),
            field("/determinism/inputs_digest"),
        ));
        if !matched.is_empty() {
            out.push_str("\n## Matched rules\n");
            for rule in matched {
                out.push_str(&format!(
                    "- `{}:{}` effect=`{}` reasons=`{}`\n",
                    rule.get("stage").and_then(Value::as_str).unwrap_or_default(),
                    rule.get("rule_id").and_then(Value::as_str).unwrap_or_default(),
                    rule.get("effect").and_then(Value::as_str).unwrap_or_default(),
                    rule.get("reason_codes").map(canonical_json).unwrap_or_default(),
                ));
            }
        }
    } else {
        out.push_str(&format!(
            "decision_id: {}\ncreated_at: {}\nverdict: {}\nreason_codes: {}\n",
            field("/decision_id"),
            field("/created_at"),
            field("/evaluation/verdict"),
            reasons,
        ));
        if !matched.is_empty() {
            out.push_str("matched_rules:\n");
            for rule in matched {
                out.push_str(&format!(
                    "  - {}:{} effect={} reasons={}\n",
                    rule.get("stage").and_then(Value::as_str).unwrap_or_default(),
                    rule.get("rule_id").and_then(Value::as_str).unwrap_or_default(),
                    rule.get("effect").and_then(Value::as_str).unwrap_or_default(),
                    rule.get("reason_codes").map(canonical_json).unwrap_or_default(),
                ));
            }
        }
    }
    out
}
