#![allow(clippy::print_stderr, clippy::print_stdout)]

//! CLI entrypoint for `tagledger`.
//!
//! The coordination logic lives in the `tagledger` library crate (`src/serial.rs`, `src/sync.rs`, etc).

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use tagledger::context::{Coordinator, CoordinatorConfig, LockTarget};
use tagledger::epc;
use tagledger::identity::Identity;
use tagledger::jobs::{JobSetKind, Signature};
use tagledger::serial::{AllocationOutcome, JobContext, UsageScope};
use tagledger::store;
use time::{Date, Month, OffsetDateTime, Time};
use tracing_subscriber::EnvFilter;

/// Exit code for "busy or unreachable, try again later".
const EXIT_TRY_LATER: i32 = 2;

#[derive(Parser)]
#[command(
    name = "tagledger",
    version,
    about = "Shared serial ledger, job sync and EPC encoding for label stations",
    long_about = "Shared serial ledger, job sync and EPC encoding for label stations.\n\n\
Every station points at the same shared folder. Serial numbers are reserved from `serial_ledger.json` \
under `serial_ledger.json.lock`; job collections are merged under `jobs.lock`.\n\n\
Use `--json` for machine-readable output.\n\
Busy locks and an unreachable shared folder exit with status 2; hard errors exit with status 1.",
    after_long_help = r#"Shared folder layout:
  serial_ledger.json        counter + audit log
  serial_ledger.json.lock   ledger lock marker
  jobs_active.json          shared active jobs
  jobs_archived.json        shared archived jobs
  jobs.lock                 jobs lock marker

Local folder layout:
  jobs_active.json, jobs_archived.json, sync_metadata.json

Environment variables (optional; only read when `--use-env` is passed):
  TAGLEDGER_SHARED_DIR  Shared folder
  TAGLEDGER_LOCAL_DIR   This station's local folder
  TAGLEDGER_USER        Operator name for audit records
  TAGLEDGER_MACHINE     Station name for audit records

Logging goes to stderr; set RUST_LOG (e.g. RUST_LOG=tagledger=debug) for detail.

Common flows:
  tagledger --shared-dir /mnt/labels serial allocate --quantity 500 --upc 036000291452 --emit-epc
  tagledger --shared-dir /mnt/labels --local-dir ~/.tagledger jobs sync --json
  tagledger epc decode 30340232801C764000000001
"#
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct GlobalArgs {
    #[arg(
        long,
        global = true,
        default_value_t = false,
        help = "Emit pretty JSON (suitable for scripting)."
    )]
    json: bool,
    #[arg(
        long,
        global = true,
        default_value_t = false,
        help = "Read TAGLEDGER_* environment variables for default values (opt-in)."
    )]
    use_env: bool,
    #[arg(
        long,
        global = true,
        default_value_t = false,
        help = "Log progress at info level to stderr (RUST_LOG overrides)."
    )]
    verbose: bool,
    #[arg(long, global = true, value_name = "DIR", help = "Shared folder every station uses.")]
    shared_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "DIR", help = "This station's local data folder.")]
    local_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "NAME", help = "Operator name (default: login user).")]
    user: Option<String>,
    #[arg(long, global = true, value_name = "NAME", help = "Station name (default: host name).")]
    machine: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reserve and inspect serial numbers.
    Serial {
        #[command(subcommand)]
        command: SerialCommands,
    },
    /// Synchronize job collections with the shared folder.
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },
    /// Convert between UPC + serial and SGTIN-96 EPC hex.
    Epc {
        #[command(subcommand)]
        command: EpcCommands,
    },
    /// Inspect or clean up shared lock markers.
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
}

#[derive(Subcommand)]
enum SerialCommands {
    /// Reserve a block of consecutive serials.
    #[command(after_long_help = r#"Examples:
  tagledger serial allocate --quantity 250 --customer Acme --ticket 4411 --po PO-9
  tagledger serial allocate --quantity 10 --upc 036000291452 --emit-epc --json
"#)]
    Allocate {
        #[arg(long, value_name = "N", help = "Number of serials (1-100000).")]
        quantity: u64,
        #[command(flatten)]
        job: JobContextArgs,
        #[arg(
            long,
            default_value_t = false,
            requires = "upc",
            help = "Also print the EPC for every reserved serial (needs --upc)."
        )]
        emit_epc: bool,
    },
    /// Show the next serial without reserving it (best effort).
    Peek,
    /// Summarize the allocation audit log.
    Usage {
        #[arg(
            long,
            value_name = "DATE",
            conflicts_with_all = ["upc", "by_user"],
            help = "Only allocations at or after DATE (YYYY-MM-DD or RFC 3339)."
        )]
        since: Option<String>,
        #[arg(long, value_name = "UPC", conflicts_with = "by_user", help = "Only allocations for this UPC.")]
        upc: Option<String>,
        #[arg(long = "by-user", value_name = "NAME", help = "Only allocations by this operator.")]
        by_user: Option<String>,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct JobContextArgs {
    #[arg(long, value_name = "NAME")]
    customer: Option<String>,
    #[arg(long = "po", value_name = "PO")]
    po_number: Option<String>,
    #[arg(long = "ticket", value_name = "TICKET")]
    ticket_number: Option<String>,
    #[arg(long, value_name = "UPC")]
    upc: Option<String>,
    #[arg(long, value_name = "SIZE")]
    label_size: Option<String>,
}

impl JobContextArgs {
    fn into_context(self) -> Option<JobContext> {
        let ctx = JobContext {
            customer: self.customer,
            po_number: self.po_number,
            ticket_number: self.ticket_number,
            upc: self.upc,
            label_size: self.label_size,
        };
        (ctx != JobContext::default()).then_some(ctx)
    }
}

#[derive(Subcommand)]
enum JobsCommands {
    /// Merge local and shared job collections and write the result to both.
    Sync,
    /// Delete a job locally and keep the next sync from bringing it back.
    Delete {
        #[arg(long, value_name = "NAME", default_value = "")]
        customer: String,
        #[arg(long, value_name = "TICKET", default_value = "")]
        ticket: String,
        #[arg(long, value_name = "PO", default_value = "")]
        po: String,
        #[arg(long, value_enum, default_value_t = JobSetKind::Active)]
        set: JobSetKind,
    },
    /// Show sync bookkeeping and pending deletions.
    Status,
}

#[derive(Subcommand)]
enum EpcCommands {
    /// Encode a 12-digit UPC and serial as 24 hex characters.
    Encode {
        #[arg(long, value_name = "UPC")]
        upc: String,
        #[arg(long, value_name = "N")]
        serial: u64,
    },
    /// Decode 24 hex characters into UPC and serial.
    Decode {
        #[arg(value_name = "HEX")]
        hex: String,
    },
    /// Complete an 11-digit UPC body with its check digit.
    CheckDigit {
        #[arg(value_name = "UPC11")]
        upc11: String,
    },
}

#[derive(Subcommand)]
enum LockCommands {
    /// Describe a lock marker, if present.
    Status {
        #[arg(long, value_enum, default_value_t = LockTarget::Ledger)]
        target: LockTarget,
    },
    /// Remove a lock marker only if it is past its staleness threshold.
    ClearStale {
        #[arg(long, value_enum, default_value_t = LockTarget::Ledger)]
        target: LockTarget,
    },
}

/// How the process should exit after a command that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Done,
    TryLater,
}

#[derive(Debug, Serialize)]
struct PeekResult {
    next_serial: u64,
}

#[derive(Debug, Serialize)]
struct EncodeResult<'a> {
    upc: &'a str,
    serial: u64,
    epc: String,
}

#[derive(Debug, Serialize)]
struct DeleteResult {
    removed: bool,
    signature: Signature,
    set: JobSetKind,
}

#[derive(Debug, Serialize)]
struct JobsStatus {
    shared_available: bool,
    pending_deletions: usize,
    #[serde(flatten)]
    metadata: tagledger::sync::SyncMetadata,
}

#[derive(Debug, Serialize)]
struct LockReport {
    locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<tagledger::lock::LockStatus>,
}

#[derive(Debug, Serialize)]
struct ClearStaleResult {
    removed: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);
    match run(cli) {
        Ok(Exit::Done) => {}
        Ok(Exit::TryLater) => std::process::exit(EXIT_TRY_LATER),
        Err(err) => {
            eprintln!("{err:?}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level));
    let Ok(filter) = filter else {
        return;
    };
    // Ignore the error if a subscriber is already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: Cli) -> anyhow::Result<Exit> {
    let global = cli.global;
    let json = global.json;

    match cli.command {
        Commands::Serial { command } => {
            let ctx = coordinator(&global, false)?;
            match command {
                SerialCommands::Allocate {
                    quantity,
                    job,
                    emit_epc,
                } => {
                    let upc = job.upc.clone();
                    if emit_epc {
                        if let Some(upc) = &upc {
                            if !epc::has_valid_check_digit(upc) {
                                anyhow::bail!("--upc {upc} is not a 12-digit UPC with a valid check digit");
                            }
                        }
                    }
                    let outcome = ctx
                        .serials()
                        .allocate(quantity, job.into_context())
                        .context("allocate serials")?;
                    let exit = outcome_exit(&outcome);
                    let mut value = serde_json::to_value(&outcome).context("serialize outcome")?;
                    if let (true, Some(upc), Some(range)) = (emit_epc, upc.as_deref(), outcome.range()) {
                        let tags = epc::encode_range(upc, range.iter()).context("encode EPCs")?;
                        if let Some(obj) = value.as_object_mut() {
                            obj.insert("epcs".to_string(), Value::from(tags));
                        }
                    }
                    write_result(json, &value)?;
                    return Ok(exit);
                }
                SerialCommands::Peek => {
                    let next_serial = ctx.serials().peek_next().context("read serial ledger")?;
                    if json {
                        write_json(&PeekResult { next_serial })?;
                    } else {
                        println!("{next_serial}");
                    }
                }
                SerialCommands::Usage {
                    since,
                    upc,
                    by_user,
                } => {
                    let scope = match (since, upc, by_user) {
                        (Some(since), _, _) => UsageScope::Since(parse_since(&since)?),
                        (None, Some(upc), _) => UsageScope::Upc(upc),
                        (None, None, Some(user)) => UsageScope::User(user),
                        (None, None, None) => UsageScope::All,
                    };
                    let summary = ctx
                        .serials()
                        .usage_summary(&scope)
                        .context("summarize serial usage")?;
                    write_result(json, &summary)?;
                }
            }
        }

        Commands::Jobs { command } => {
            let ctx = coordinator(&global, true)?;
            match command {
                JobsCommands::Sync => {
                    let result = ctx.jobs().sync();
                    write_result(json, &result)?;
                    if result.status.is_recoverable() {
                        return Ok(Exit::TryLater);
                    }
                    if !result.success {
                        anyhow::bail!("job sync failed: {}", result.message);
                    }
                }
                JobsCommands::Delete {
                    customer,
                    ticket,
                    po,
                    set,
                } => {
                    let signature = Signature::new(&customer, &ticket, &po);
                    let removed = match ctx.jobs().delete_local(&signature, set) {
                        Ok(removed) => removed,
                        Err(err) if err.is_recoverable() => {
                            eprintln!("delete job {signature}: {err}");
                            return Ok(Exit::TryLater);
                        }
                        Err(err) => {
                            return Err(anyhow::Error::new(err).context(format!("delete job {signature}")))
                        }
                    };
                    write_result(
                        json,
                        &DeleteResult {
                            removed,
                            signature,
                            set,
                        },
                    )?;
                }
                JobsCommands::Status => {
                    let metadata = ctx.jobs().metadata().context("read sync metadata")?;
                    write_result(
                        json,
                        &JobsStatus {
                            shared_available: ctx.jobs().is_shared_available(),
                            pending_deletions: metadata.deleted_jobs.len(),
                            metadata,
                        },
                    )?;
                }
            }
        }

        Commands::Epc { command } => match command {
            EpcCommands::Encode { upc, serial } => {
                let hex = epc::encode(&upc, serial).context("encode EPC")?;
                if json {
                    write_json(&EncodeResult {
                        upc: &upc,
                        serial,
                        epc: hex,
                    })?;
                } else {
                    println!("{hex}");
                }
            }
            EpcCommands::Decode { hex } => {
                let decoded = epc::decode(&hex).context("decode EPC")?;
                write_result(json, &decoded)?;
            }
            EpcCommands::CheckDigit { upc11 } => {
                let upc = epc::complete_upc(&upc11).context("compute check digit")?;
                if json {
                    write_json(&upc)?;
                } else {
                    println!("{upc}");
                }
            }
        },

        Commands::Lock { command } => {
            let ctx = coordinator(&global, false)?;
            match command {
                LockCommands::Status { target } => {
                    let (lock, policy) = ctx.lock(target);
                    let status = lock.status(policy.stale_after).context("inspect lock")?;
                    write_result(
                        json,
                        &LockReport {
                            locked: status.is_some(),
                            status,
                        },
                    )?;
                }
                LockCommands::ClearStale { target } => {
                    let (lock, policy) = ctx.lock(target);
                    let removed = lock.clear_stale(policy.stale_after).context("clear stale lock")?;
                    write_result(json, &ClearStaleResult { removed })?;
                }
            }
        }
    }

    Ok(Exit::Done)
}

const fn outcome_exit(outcome: &AllocationOutcome) -> Exit {
    match outcome {
        AllocationOutcome::Allocated { .. } | AllocationOutcome::Cancelled => Exit::Done,
        AllocationOutcome::Busy { .. } | AllocationOutcome::StorageUnavailable { .. } => {
            Exit::TryLater
        }
    }
}

fn coordinator(global: &GlobalArgs, needs_local: bool) -> anyhow::Result<Coordinator> {
    let shared_dir = require_path_or_env(
        global.shared_dir.clone(),
        global.use_env,
        "TAGLEDGER_SHARED_DIR",
        "--shared-dir",
    )?;
    let local_dir = if needs_local {
        require_path_or_env(
            global.local_dir.clone(),
            global.use_env,
            "TAGLEDGER_LOCAL_DIR",
            "--local-dir",
        )?
    } else {
        global
            .local_dir
            .clone()
            .or_else(|| opt_env_pathbuf(global.use_env, "TAGLEDGER_LOCAL_DIR"))
            .map_or_else(|| shared_dir.clone(), |dir| dir)
    };
    Ok(Coordinator::new(CoordinatorConfig::new(
        shared_dir,
        local_dir,
        resolve_identity(global),
    )))
}

fn resolve_identity(global: &GlobalArgs) -> Identity {
    let detected = Identity::detect();
    let user = global
        .user
        .clone()
        .or_else(|| opt_env_string(global.use_env, "TAGLEDGER_USER"))
        .map_or(detected.user, |user| user);
    let machine = global
        .machine
        .clone()
        .or_else(|| opt_env_string(global.use_env, "TAGLEDGER_MACHINE"))
        .map_or(detected.machine, |machine| machine);
    Identity::new(user, machine)
}

fn parse_since(raw: &str) -> anyhow::Result<OffsetDateTime> {
    if let Ok(at) = store::parse_rfc3339(raw) {
        return Ok(at);
    }
    let date = parse_date_ymd(raw).with_context(|| format!("invalid --since {raw:?}"))?;
    Ok(date.with_time(Time::MIDNIGHT).assume_utc())
}

fn parse_date_ymd(s: &str) -> anyhow::Result<Date> {
    let mut parts = s.split('-');
    let year: i32 = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("invalid date: missing year"))?
        .parse()
        .context("parse year")?;
    let month_u8: u8 = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("invalid date: missing month"))?
        .parse()
        .context("parse month")?;
    let day: u8 = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("invalid date: missing day"))?
        .parse()
        .context("parse day")?;
    if parts.next().is_some() {
        return Err(anyhow::anyhow!("invalid date: too many components"));
    }
    let month = Month::try_from(month_u8).context("invalid month")?;
    Date::from_calendar_date(year, month, day).context("invalid calendar date")
}

fn write_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    let raw = serde_json::to_string_pretty(value).context("serialize JSON")?;
    stdout.write_all(raw.as_bytes()).context("write stdout")?;
    stdout.write_all(b"\n").context("write stdout newline")?;
    Ok(())
}

fn write_result<T: Serialize>(json: bool, value: &T) -> anyhow::Result<()> {
    if json {
        write_json(value)
    } else {
        // human output: best-effort JSON on one line.
        println!("{}", serde_json::to_string(value).context("serialize")?);
        Ok(())
    }
}

fn opt_env_string(use_env: bool, key: &str) -> Option<String> {
    if !use_env {
        return None;
    }
    std::env::var(key).ok()
}

fn opt_env_pathbuf(use_env: bool, key: &str) -> Option<PathBuf> {
    if !use_env {
        return None;
    }
    std::env::var_os(key).map(PathBuf::from)
}

fn require_path_or_env(
    value: Option<PathBuf>,
    use_env: bool,
    env_key: &str,
    arg_flag: &str,
) -> anyhow::Result<PathBuf> {
    value
        .or_else(|| opt_env_pathbuf(use_env, env_key))
        .ok_or_else(|| {
            if use_env {
                anyhow::anyhow!(
                    "missing {arg_flag}; pass {arg_flag} (or set {env_key} and pass --use-env)"
                )
            } else {
                anyhow::anyhow!("missing {arg_flag}; pass {arg_flag}")
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::ensure;
    use clap::CommandFactory;

    fn globals() -> GlobalArgs {
        GlobalArgs {
            json: false,
            use_env: false,
            verbose: false,
            shared_dir: None,
            local_dir: None,
            user: Some("alice".to_string()),
            machine: Some("press-1".to_string()),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_since_accepts_dates_and_timestamps() -> anyhow::Result<()> {
        ensure!(parse_since("2026-01-11")?.unix_timestamp() == 1_768_089_600);
        ensure!(parse_since("2026-01-11T06:00:00Z")?.unix_timestamp() == 1_768_111_200);
        ensure!(parse_since("2026-13-01").is_err());
        ensure!(parse_since("yesterday").is_err());
        Ok(())
    }

    #[test]
    fn parse_date_ymd_rejects_extra_components() -> anyhow::Result<()> {
        ensure!(parse_date_ymd("2026-01-11")?.to_string() == "2026-01-11");
        ensure!(parse_date_ymd("2026-01-11-01").is_err());
        Ok(())
    }

    #[test]
    fn shared_dir_is_required() -> anyhow::Result<()> {
        let err = match coordinator(&globals(), false) {
            Ok(_) => anyhow::bail!("expected missing --shared-dir"),
            Err(err) => err,
        };
        ensure!(err.to_string().contains("--shared-dir"));
        Ok(())
    }

    #[test]
    fn local_dir_is_required_for_jobs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut args = globals();
        args.shared_dir = Some(dir.path().to_path_buf());
        ensure!(coordinator(&args, false).is_ok());
        let Err(err) = coordinator(&args, true) else {
            anyhow::bail!("expected missing --local-dir");
        };
        ensure!(err.to_string().contains("--local-dir"));
        Ok(())
    }

    #[test]
    fn explicit_identity_wins() -> anyhow::Result<()> {
        let identity = resolve_identity(&globals());
        ensure!(identity == Identity::new("alice", "press-1"));
        Ok(())
    }

    #[test]
    fn empty_job_context_is_omitted() -> anyhow::Result<()> {
        ensure!(JobContextArgs::default().into_context().is_none());
        let ctx = JobContextArgs {
            customer: Some("Acme".to_string()),
            ..JobContextArgs::default()
        }
        .into_context();
        ensure!(ctx.and_then(|c| c.customer).as_deref() == Some("Acme"));
        Ok(())
    }
}
