//! Purpose: Compile an NCBI-style names/nodes dump into a data + metadata store pair.
//! Exports: `DumpTables`, `CompileConfig`, `CompileOutcome`, `ErrorPolicy`, `Progress`,
//!   `RecordSink`, `ClassCodes`, `parse_names`, `parse_nodes`, `compile_tables`, `compile_dump`.
//! Role: Build-time encoder; the only producer of snapshot files.
//! Invariants: Data record = `[id, parent, rank, names...]`, scientific name first.
//! Invariants: Metadata record = `[id, classes...]`, positionally aligned with the names.
//! Invariants: Identifiers are emitted in first-seen order of the names stream.
//! Invariants: Both records of an identifier are validated before either is written.
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use bstr::io::BufReadExt;
use bstr::{BString, ByteSlice};

use crate::core::codec;
use crate::core::error::{Error, ErrorKind};
use crate::core::store::{StoreBuilder, StoreWriter, WriteSummary};

/// Snapshot file holding `[id, parent, rank, names...]` records.
pub const DATA_FILE: &str = "ncbi_taxonomy.db";
/// Snapshot file holding `[id, classes...]` records.
pub const INFO_FILE: &str = "ncbi_taxonomy_inf.db";
/// Name class that always sorts first.
pub const SCIENTIFIC_NAME: &str = "scientific name";

const DUMP_DELIMITER: &str = "\t|\t";
const NAMES_FIELDS: usize = 4;
const NODES_FIELDS: usize = 3;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ErrorPolicy {
    /// Abort the build on the first malformed line or orphaned identifier.
    #[default]
    Stop,
    /// Drop the offending line or record, log it, and keep going.
    Skip,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct CompileConfig {
    pub errors: ErrorPolicy,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Progress {
    pub index: usize,
    pub total: usize,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CompileOutcome {
    pub records: u64,
    pub skipped_lines: u64,
    pub skipped_records: u64,
    pub data: WriteSummary,
    pub info: WriteSummary,
}

/// Destination for compiled records.
pub trait RecordSink {
    fn write_record(&mut self, fields: &[&[u8]]) -> Result<(), Error>;
}

impl RecordSink for StoreBuilder {
    fn write_record(&mut self, fields: &[&[u8]]) -> Result<(), Error> {
        self.insert(fields)
    }
}

impl RecordSink for StoreWriter {
    fn write_record(&mut self, fields: &[&[u8]]) -> Result<(), Error> {
        self.write(fields)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NameEntry {
    pub name: BString,
    pub class: BString,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeEntry {
    pub parent: BString,
    pub rank: BString,
}

/// Parsed dump, grouped by identifier.
#[derive(Debug, Default)]
pub struct DumpTables {
    order: Vec<BString>,
    names: HashMap<BString, Vec<NameEntry>>,
    nodes: HashMap<BString, NodeEntry>,
}

impl DumpTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_name(&mut self, id: BString, entry: NameEntry) {
        match self.names.get_mut(&id) {
            Some(entries) => entries.push(entry),
            None => {
                self.order.push(id.clone());
                self.names.insert(id, vec![entry]);
            }
        }
    }

    /// Later lines for the same identifier replace earlier ones.
    pub fn add_node(&mut self, id: BString, entry: NodeEntry) {
        self.nodes.insert(id, entry);
    }

    /// Identifiers with at least one name, in first-seen order.
    pub fn ids(&self) -> &[BString] {
        &self.order
    }

    pub fn names(&self, id: &BString) -> &[NameEntry] {
        self.names.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn node(&self, id: &BString) -> Option<&NodeEntry> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Integer sort keys for name classes, assigned on first encounter.
#[derive(Debug)]
pub struct ClassCodes {
    codes: HashMap<Vec<u8>, u32>,
    next: u32,
}

impl ClassCodes {
    pub fn new() -> Self {
        let mut codes = Self {
            codes: HashMap::new(),
            next: 0,
        };
        codes.code(SCIENTIFIC_NAME.as_bytes());
        codes
    }

    pub fn code(&mut self, class: &[u8]) -> u32 {
        if let Some(code) = self.codes.get(class) {
            return *code;
        }
        let code = self.next;
        self.next += 1;
        self.codes.insert(class.to_vec(), code);
        code
    }

    /// Stable sort of `names` by class code.
    pub fn order<'a>(&mut self, names: &'a [NameEntry]) -> Vec<&'a NameEntry> {
        let keys: Vec<u32> = names.iter().map(|entry| self.code(&entry.class)).collect();
        let mut indices: Vec<usize> = (0..names.len()).collect();
        indices.sort_by_key(|&index| keys[index]);
        indices.into_iter().map(|index| &names[index]).collect()
    }
}

impl Default for ClassCodes {
    fn default() -> Self {
        Self::new()
    }
}

struct LineSkipper {
    policy: ErrorPolicy,
    skipped: u64,
}

impl LineSkipper {
    fn reject(&mut self, err: Error) -> Result<(), Error> {
        match self.policy {
            ErrorPolicy::Stop => Err(err),
            ErrorPolicy::Skip => {
                tracing::warn!(error = %err, "skipping malformed dump line");
                self.skipped += 1;
                Ok(())
            }
        }
    }
}

fn malformed_line(source: &Path, line: u64, message: String) -> Error {
    Error::new(ErrorKind::MalformedInput)
        .with_message(message)
        .with_path(source)
        .with_line(line)
}

fn io_error(source: &Path, err: std::io::Error) -> Error {
    Error::new(ErrorKind::Io).with_path(source).with_source(err)
}

fn strip_trailing_delimiter(line: &[u8]) -> &[u8] {
    line.trim_end_with(|c| matches!(c, '\t' | '|' | '\n' | '\r'))
}

/// Reads `id | name | unique_name | name_class` lines into `tables`.
///
/// Returns the number of skipped lines (always zero under `ErrorPolicy::Stop`).
pub fn parse_names<R: BufRead>(
    reader: R,
    source: &Path,
    policy: ErrorPolicy,
    tables: &mut DumpTables,
) -> Result<u64, Error> {
    let mut skipper = LineSkipper { policy, skipped: 0 };
    for (index, line) in reader.byte_lines().enumerate() {
        let line = line.map_err(|err| io_error(source, err))?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&[u8]> = strip_trailing_delimiter(&line)
            .split_str(DUMP_DELIMITER)
            .collect();
        let &[id, name, unique_name, class] = fields.as_slice() else {
            skipper.reject(malformed_line(
                source,
                index as u64 + 1,
                format!(
                    "names line has {} fields, expected {NAMES_FIELDS}",
                    fields.len()
                ),
            ))?;
            continue;
        };
        let name = if unique_name.is_empty() { name } else { unique_name };
        tables.add_name(
            BString::from(id),
            NameEntry {
                name: BString::from(name),
                class: BString::from(class),
            },
        );
    }
    Ok(skipper.skipped)
}

/// Reads `id | parent_id | rank | ...` lines into `tables`; extra fields are ignored.
pub fn parse_nodes<R: BufRead>(
    reader: R,
    source: &Path,
    policy: ErrorPolicy,
    tables: &mut DumpTables,
) -> Result<u64, Error> {
    let mut skipper = LineSkipper { policy, skipped: 0 };
    for (index, line) in reader.byte_lines().enumerate() {
        let line = line.map_err(|err| io_error(source, err))?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&[u8]> = strip_trailing_delimiter(&line)
            .splitn_str(NODES_FIELDS + 1, DUMP_DELIMITER)
            .take(NODES_FIELDS)
            .collect();
        let &[id, parent, rank] = fields.as_slice() else {
            skipper.reject(malformed_line(
                source,
                index as u64 + 1,
                format!(
                    "nodes line has {} fields, expected at least {NODES_FIELDS}",
                    fields.len()
                ),
            ))?;
            continue;
        };
        tables.add_node(
            BString::from(id),
            NodeEntry {
                parent: BString::from(parent),
                rank: BString::from(rank),
            },
        );
    }
    Ok(skipper.skipped)
}

/// Milestone step so the callback fires roughly once per percent.
fn progress_step(total: usize) -> usize {
    (total / 100).max(1)
}

/// Emits one data and one metadata record per identifier in `tables`.
pub fn compile_tables<D, I, P>(
    tables: &DumpTables,
    data: &mut D,
    info: &mut I,
    config: CompileConfig,
    mut on_progress: P,
) -> Result<CompileOutcome, Error>
where
    D: RecordSink,
    I: RecordSink,
    P: FnMut(Progress),
{
    let mut outcome = CompileOutcome::default();
    let mut codes = ClassCodes::new();
    let total = tables.ids().len();
    let step = progress_step(total);

    for (index, id) in tables.ids().iter().enumerate() {
        match compile_one(tables, id, &mut codes, data, info) {
            Ok(()) => outcome.records += 1,
            Err(err) => match (config.errors, err.kind()) {
                (ErrorPolicy::Skip, ErrorKind::MalformedInput | ErrorKind::EncodingViolation) => {
                    tracing::warn!(id = %id, error = %err, "skipping taxon");
                    outcome.skipped_records += 1;
                }
                _ => return Err(err),
            },
        }
        if index % step == 0 {
            on_progress(Progress { index, total });
        }
    }
    Ok(outcome)
}

fn compile_one<D: RecordSink, I: RecordSink>(
    tables: &DumpTables,
    id: &BString,
    codes: &mut ClassCodes,
    data: &mut D,
    info: &mut I,
) -> Result<(), Error> {
    let node = tables.node(id).ok_or_else(|| {
        Error::new(ErrorKind::MalformedInput)
            .with_message(format!("taxon {id} has names but no node entry"))
    })?;
    let names = codes.order(tables.names(id));

    let mut data_fields: Vec<&[u8]> = Vec::with_capacity(3 + names.len());
    data_fields.extend([id.as_bytes(), node.parent.as_bytes(), node.rank.as_bytes()]);
    data_fields.extend(names.iter().map(|entry| entry.name.as_bytes()));

    let mut info_fields: Vec<&[u8]> = Vec::with_capacity(1 + names.len());
    info_fields.push(id.as_bytes());
    info_fields.extend(names.iter().map(|entry| entry.class.as_bytes()));

    codec::validate_fields(&data_fields)?;
    codec::validate_fields(&info_fields)?;
    data.write_record(&data_fields)?;
    info.write_record(&info_fields)
}

/// Parses both dump files and writes `DATA_FILE` and `INFO_FILE` into `out_dir`.
pub fn compile_dump<P: FnMut(Progress)>(
    names_path: &Path,
    nodes_path: &Path,
    out_dir: &Path,
    config: CompileConfig,
    on_progress: P,
) -> Result<CompileOutcome, Error> {
    let mut tables = DumpTables::new();
    let mut skipped_lines =
        parse_names(open_dump(names_path)?, names_path, config.errors, &mut tables)?;
    skipped_lines +=
        parse_nodes(open_dump(nodes_path)?, nodes_path, config.errors, &mut tables)?;
    tracing::info!(
        taxa = tables.ids().len(),
        nodes = tables.node_count(),
        skipped_lines,
        "parsed taxonomy dump"
    );

    std::fs::create_dir_all(out_dir)
        .map_err(|err| Error::new(ErrorKind::Io).with_path(out_dir).with_source(err))?;
    let mut data = StoreBuilder::new().create(out_dir.join(DATA_FILE))?;
    let mut info = StoreBuilder::new().create(out_dir.join(INFO_FILE))?;

    let mut outcome = compile_tables(&tables, &mut data, &mut info, config, on_progress)?;
    outcome.skipped_lines = skipped_lines;
    data.sync()?;
    info.sync()?;
    tracing::debug!(
        data = %data.path().display(),
        info = %info.path().display(),
        "replacing snapshot files"
    );
    outcome.data = data.finish()?;
    outcome.info = info.finish()?;
    tracing::info!(
        records = outcome.records,
        skipped_records = outcome.skipped_records,
        data_bytes = outcome.data.bytes,
        info_bytes = outcome.info.bytes,
        "compiled taxonomy snapshot"
    );
    Ok(outcome)
}

fn open_dump(path: &Path) -> Result<BufReader<File>, Error> {
    let file = File::open(path).map_err(|err| {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::Io,
        };
        Error::new(kind)
            .with_message("cannot open dump file")
            .with_path(path)
            .with_source(err)
    })?;
    Ok(BufReader::new(file))
}
