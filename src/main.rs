//! Purpose: `taxdb` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit JSON on stdout (one document, or one line per id for `ids`).
//! Invariants: Errors go to stderr as JSON when stderr is not a terminal.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Diagnostics and progress are `tracing` events on stderr, never stdout.
use std::error::Error as StdError;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod snapshot_paths;

use snapshot_paths::default_snapshot_dir;
use taxdb::api::{Error, ErrorKind, ErrorPolicy, to_exit_code};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `taxdb --help`."));
            }
        },
    };

    init_tracing(cli.verbose);
    let dir = cli.dir.unwrap_or_else(default_snapshot_dir);

    command_dispatch::dispatch_command(cli.command, dir)
        .map_err(add_io_hint)
        .map_err(add_format_hint)
}

#[derive(Parser)]
#[command(
    name = "taxdb",
    version,
    about = "Flat-file NCBI taxonomy lookups",
    long_about = None,
    after_help = r#"EXAMPLES
  $ taxdb compile --names names.dmp --nodes nodes.dmp
  $ taxdb search "homo sapiens"
  $ taxdb name 9606
  $ taxdb other-names 9606

Snapshots live in ~/.taxdb/snapshot unless --dir is given.
Set RUST_LOG (e.g. RUST_LOG=taxdb=debug) for detailed diagnostics."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Snapshot directory (default: ~/.taxdb/snapshot)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Log progress to stderr (-v info, -vv debug)"
    )]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Build a snapshot from NCBI names.dmp and nodes.dmp")]
    Compile {
        #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
        names: PathBuf,
        #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
        nodes: PathBuf,
        #[arg(
            long,
            value_name = "DIR",
            help = "Output directory (default: --dir)",
            value_hint = ValueHint::DirPath
        )]
        out: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = ErrorsArg::Stop, help = "What to do with malformed dump lines")]
        errors: ErrorsArg,
    },
    #[command(about = "Print the raw record stored for an id")]
    Get {
        id: String,
        #[arg(long, help = "Read the metadata (name class) store instead of the data store")]
        meta: bool,
    },
    #[command(about = "Print parent, rank, and all names of a taxon")]
    Taxon { id: String },
    #[command(about = "Print the scientific name of a taxon")]
    Name { id: String },
    #[command(name = "other-names", about = "Print every non-scientific name with its class")]
    OtherNames { id: String },
    #[command(about = "Find taxa whose record contains TEXT (case-insensitive)")]
    Search {
        text: String,
        #[arg(long, help = "Include taxa of every rank, not just species")]
        all_ranks: bool,
    },
    #[command(about = "List taxon ids in snapshot order, one JSON string per line")]
    Ids {
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
    #[command(about = "Generate shell completion scripts")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ErrorsArg {
    Stop,
    Skip,
}

impl From<ErrorsArg> for ErrorPolicy {
    fn from(value: ErrorsArg) -> Self {
        match value {
            ErrorsArg::Stop => ErrorPolicy::Stop,
            ErrorsArg::Skip => ErrorPolicy::Skip,
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

/// Writes one compact JSON value per line; a closed pipe ends the stream quietly.
fn emit_json_line(out: &mut impl Write, value: &Value) -> Result<bool, Error> {
    match writeln!(out, "{value}") {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(false),
        Err(err) => Err(Error::new(ErrorKind::Io)
            .with_message("failed to write to stdout")
            .with_source(err)),
    }
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::MalformedInput => "malformed input".to_string(),
        ErrorKind::EncodingViolation => "field contains a reserved byte".to_string(),
        ErrorKind::BoundaryScan => "record boundary not found".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(line) = err.line() {
        inner.insert("line".to_string(), json!(line));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        match err.line() {
            Some(line) => lines.push(format!("path: {}:{line}", path.display())),
            None => lines.push(format!("path: {}", path.display())),
        }
    }
    if let Some(offset) = err.offset() {
        lines.push(format!("offset: {offset}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => err.with_hint(
            "Permission denied. Check directory permissions or use --dir to a writable location.",
        ),
        ErrorKind::Busy => {
            err.with_hint("Another build holds the snapshot lock. Wait for it to finish and retry.")
        }
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        _ => err,
    }
}

fn add_format_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::BoundaryScan => {
            err.with_hint("Snapshot file looks truncated or corrupt. Rebuild it with `taxdb compile`.")
        }
        ErrorKind::MalformedInput => {
            err.with_hint("Fix the dump file, or pass `--errors skip` to drop bad lines.")
        }
        ErrorKind::EncodingViolation => err.with_hint(
            "Dump text contains bytes 0xFD-0xFF, which the store reserves. Pass `--errors skip` to drop those taxa.",
        ),
        _ => err,
    }
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
