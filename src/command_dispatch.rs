//! Purpose: Hold top-level CLI command dispatch for `taxdb`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Lookup commands open the snapshot once per invocation.
//! Invariants: Output envelopes are JSON; text fields are converted lossily from bytes.

use super::*;

use bstr::{BString, ByteSlice};
use clap::CommandFactory;
use taxdb::api::{CompileConfig, Progress, Taxonomy, compile_dump};

use crate::snapshot_paths::resolve_snapshot_dir;

pub(super) fn dispatch_command(command: Command, dir: PathBuf) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "taxdb", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Compile {
            names,
            nodes,
            out,
            errors,
        } => {
            let out = resolve_snapshot_dir(out, &dir);
            let config = CompileConfig {
                errors: errors.into(),
            };
            let outcome = compile_dump(&names, &nodes, &out, config, log_progress)?;
            emit_json(json!({
                "dir": out.display().to_string(),
                "records": outcome.records,
                "skipped_lines": outcome.skipped_lines,
                "skipped_records": outcome.skipped_records,
                "data": {
                    "records": outcome.data.records,
                    "bytes": outcome.data.bytes,
                },
                "info": {
                    "records": outcome.info.records,
                    "bytes": outcome.info.bytes,
                },
            }));
            Ok(RunOutcome::ok())
        }
        Command::Get { id, meta } => {
            let taxonomy = Taxonomy::open(&dir)?;
            let record = if meta {
                taxonomy.info().get(&id).map_err(|err| {
                    if err.kind() == ErrorKind::NotFound {
                        err.with_message(format!("unknown taxonomy id {id}"))
                    } else {
                        err
                    }
                })?
            } else {
                taxonomy.get_record(&id)?
            };
            emit_json(json!({
                "id": id,
                "fields": lossy_all(record.fields()),
            }));
            Ok(RunOutcome::ok())
        }
        Command::Taxon { id } => {
            let taxonomy = Taxonomy::open(&dir)?;
            let taxon = taxonomy.taxon(&id)?;
            let value = serde_json::to_value(&taxon).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode taxon")
                    .with_source(err)
            })?;
            emit_json(value);
            Ok(RunOutcome::ok())
        }
        Command::Name { id } => {
            let taxonomy = Taxonomy::open(&dir)?;
            let name = taxonomy.scientific_name(&id)?;
            emit_json(json!({ "id": id, "name": lossy(&name) }));
            Ok(RunOutcome::ok())
        }
        Command::OtherNames { id } => {
            let taxonomy = Taxonomy::open(&dir)?;
            let names: Vec<Value> = taxonomy
                .other_names(&id)?
                .iter()
                .map(|(name, class)| json!({ "name": lossy(name), "class": lossy(class) }))
                .collect();
            emit_json(json!({ "id": id, "names": names }));
            Ok(RunOutcome::ok())
        }
        Command::Search { text, all_ranks } => {
            let taxonomy = Taxonomy::open(&dir)?;
            let ids = if all_ranks {
                taxonomy.search(&text)?
            } else {
                taxonomy.search_species(&text)?
            };
            tracing::debug!(query = %text, hits = ids.len(), all_ranks, "search finished");
            emit_json(json!({ "query": text, "ids": lossy_all(&ids) }));
            Ok(RunOutcome::ok())
        }
        Command::Ids { limit } => {
            let taxonomy = Taxonomy::open(&dir)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for id in taxonomy.iterate_ids().take(limit.unwrap_or(usize::MAX)) {
                let id = id?;
                if !emit_json_line(&mut out, &json!(lossy(&id)))? {
                    break;
                }
            }
            Ok(RunOutcome::ok())
        }
    }
}

fn log_progress(progress: Progress) {
    let percent = if progress.total == 0 {
        100
    } else {
        progress.index * 100 / progress.total
    };
    tracing::info!(
        index = progress.index,
        total = progress.total,
        percent,
        "compiling taxonomy"
    );
}

fn lossy(value: &BString) -> String {
    value.to_str_lossy().into_owned()
}

fn lossy_all(values: &[BString]) -> Vec<String> {
    values.iter().map(lossy).collect()
}
