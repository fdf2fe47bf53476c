//! Purpose: Define the public Rust API boundary for taxdb.
//! Exports: Store, codec, compiler, and taxonomy types needed by the CLI and callers.
//! Role: Additive-only surface; callers should not reach into `core` paths directly.
//! Invariants: Re-exports only; no logic lives here beyond the taxonomy handle.

mod taxonomy;

pub use crate::core::codec::{END_MARK, Record, SEP, START_MARK, decode, encode};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::dump::{
    CompileConfig, CompileOutcome, DATA_FILE, ErrorPolicy, INFO_FILE, Progress, RecordSink,
    SCIENTIFIC_NAME, compile_dump, compile_tables,
};
pub use crate::core::store::{Ids, RecordStore, StoreBuilder, StoreWriter, WriteSummary};
pub use taxonomy::{Taxon, TaxonName, Taxonomy};
