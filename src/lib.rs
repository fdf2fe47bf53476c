//! Purpose: Library crate behind the `taxdb` CLI: a flat-file taxonomy record store.
//! Exports: `api` (public surface), `core` (codec, store, cache, dump compiler, errors).
//! Role: Builds snapshots from NCBI taxdump files and answers id/name/search lookups.
//! Invariants: Stores are rebuilt wholesale; nothing is updated in place.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
