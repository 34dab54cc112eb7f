use anyhow::{bail, Context, Result};
use cabin_artifact::WorkflowId;
use cabin_kernel::audit::{verify_chain, verify_signature, AuditStore, FileAuditStore};
use cabin_kernel::config::OrchestratorConfig;
use cabin_kernel::telemetry::init_tracing;
use cabin_kernel::wal::{fold_state, FileWalStore, WriteAheadLog};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use ed25519_dalek::VerifyingKey;
use std::path::PathBuf;
use std::sync::Arc;

fn cli() -> Command {
    Command::new("cabin-kernel")
        .version(cabin_kernel::VERSION)
        .about("CabinCrew workflow kernel: WAL replay and audit verification")
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Debug logging unless RUST_LOG is set"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("replay")
                .about("Replay one workflow's WAL and print its state")
                .arg(wal_dir_arg())
                .arg(
                    Arg::new("workflow")
                        .long("workflow")
                        .required(true)
                        .value_parser(value_parser!(WorkflowId))
                        .help("Workflow id"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the full state record as JSON"),
                ),
        )
        .subcommand(
            Command::new("verify-wal")
                .about("Verify every workflow log in a WAL directory")
                .arg(wal_dir_arg()),
        )
        .subcommand(
            Command::new("verify-audit")
                .about("Verify the audit ledger's hash chain and signatures")
                .arg(
                    Arg::new("ledger")
                        .long("ledger")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Audit ledger file (JSON lines)"),
                )
                .arg(
                    Arg::new("public-key")
                        .long("public-key")
                        .help("Hex Ed25519 public key; checks every signature"),
                ),
        )
        .subcommand(
            Command::new("show-config")
                .about("Load, validate and print a configuration file")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML or YAML configuration"),
                ),
        )
}

fn wal_dir_arg() -> Arg {
    Arg::new("wal-dir")
        .long("wal-dir")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Directory holding <workflow>.wal.jsonl files")
}

fn open_wal(args: &ArgMatches) -> Result<WriteAheadLog> {
    let dir = args
        .get_one::<PathBuf>("wal-dir")
        .context("--wal-dir is required")?;
    let store = FileWalStore::open(dir)
        .with_context(|| format!("cannot open WAL directory {}", dir.display()))?;
    Ok(WriteAheadLog::new(Arc::new(store)))
}

fn replay(args: &ArgMatches) -> Result<()> {
    let wal = open_wal(args)?;
    let workflow_id = args
        .get_one::<WorkflowId>("workflow")
        .context("--workflow is required")?;
    let entries = wal.replay(workflow_id)?;
    if entries.is_empty() {
        bail!("no WAL entries for workflow {workflow_id}");
    }
    let record = fold_state(&entries)?;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("Workflow: {}", record.workflow_id);
        println!("  State: {}", record.current_state);
        println!("  Entries: {}", record.last_sequence);
        if let Some(hash) = record.plan_token_hash {
            println!("  Plan token: {hash}");
        }
        if let Some(decision) = record.last_decision {
            println!("  Last decision: {decision}");
        }
        println!("  Steps completed: {}", record.steps_completed.len());
        println!("  Pending approvals: {}", record.pending_approvals.len());
        if let Some(failure) = &record.failure {
            println!("  Failure ({:?}): {}", failure.kind, failure.error);
        }
    }
    Ok(())
}

fn verify_wal(args: &ArgMatches) -> Result<bool> {
    let wal = open_wal(args)?;
    let mut healthy = true;
    for workflow_id in wal.workflows()? {
        let (entries, corruption) = wal.replay_prefix(&workflow_id)?;
        match (corruption, fold_state(&entries)) {
            (Some(e), _) => {
                healthy = false;
                println!("CORRUPT  {workflow_id}: {e}");
            }
            (None, Err(e)) => {
                healthy = false;
                println!("INVALID  {workflow_id}: {e}");
            }
            (None, Ok(record)) => {
                println!(
                    "OK       {workflow_id}: {} entries, {}",
                    record.last_sequence, record.current_state
                );
            }
        }
    }
    Ok(healthy)
}

fn verify_audit(args: &ArgMatches) -> Result<bool> {
    let path = args
        .get_one::<PathBuf>("ledger")
        .context("--ledger is required")?;
    let events = FileAuditStore::open(path)?.load()?;
    let verification = verify_chain(&events);
    println!("Audit ledger: {}", path.display());
    println!("  Events checked: {}", verification.events_checked);
    match verification.first_broken_index {
        Some(index) => println!("  Chain: BROKEN at event {index}"),
        None => println!("  Chain: OK"),
    }

    let mut healthy = verification.valid;
    if let Some(key) = args.get_one::<String>("public-key") {
        let bytes: [u8; 32] = hex::decode(key)
            .context("public key is not hex")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("public key must be 32 bytes"))?;
        let key = VerifyingKey::from_bytes(&bytes).context("invalid Ed25519 public key")?;
        let mut unsigned = 0usize;
        for (index, event) in events.iter().enumerate() {
            if event.signature.is_none() {
                unsigned += 1;
            } else if !verify_signature(event, &key)? {
                healthy = false;
                println!("  Signature: INVALID at event {index}");
            }
        }
        println!("  Unsigned events: {unsigned}");
    }
    Ok(healthy)
}

fn show_config(args: &ArgMatches) -> Result<()> {
    let path = args
        .get_one::<PathBuf>("config")
        .context("--config is required")?;
    let config = OrchestratorConfig::load(path)?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("verbose"), matches.get_flag("log-json"));

    let healthy = match matches.subcommand() {
        Some(("replay", args)) => replay(args).map(|()| true)?,
        Some(("verify-wal", args)) => verify_wal(args)?,
        Some(("verify-audit", args)) => verify_audit(args)?,
        Some(("show-config", args)) => show_config(args).map(|()| true)?,
        _ => true,
    };
    if !healthy {
        std::process::exit(1);
    }
    Ok(())
}
