//! # Tabload I/O
//!
//! Concrete adapters at the edges of the ingestion pipeline.
//!
//! ## Components
//!
//! - **Storage**: a [`store::FileStore`] owns the source, archive, and
//!   duplicates locations and speaks to local directories or object stores
//!   (S3, GCS, Azure, HTTP) behind one interface.
//! - **Readers**: per-format decoders (CSV, Excel, JSON, Parquet, with
//!   transparent gzip) that stream a file into fixed-size batches of raw
//!   field maps over a bounded channel.
//! - **Notifiers**: best-effort email and webhook delivery of structured
//!   failure records.

/// Storage locations and object access
pub mod store;

/// Per-format record readers
pub mod read;

/// Email and webhook notifiers
pub mod notify;
