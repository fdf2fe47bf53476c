// Core modules implementing the record format, the scan-based store, and the dump compiler.
pub mod cache;
pub mod codec;
pub mod dump;
pub mod error;
pub mod store;
