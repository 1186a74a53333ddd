//! # Tabload Pipeline
//!
//! The per-file ingestion machinery: the validator that types raw records
//! against a declared schema, the runner that drives one file through the
//! dedupe, archive, stream, audit, publish, and cleanup phases, and the
//! worker pool that processes many files with bounded concurrency.
//!
//! ## Shape of one file
//!
//! ```text
//! reader ──batches──▶ validator ──(accepted|rejected)──▶ stage writer
//! ```
//!
//! The three stages run as concurrent tasks joined at the end; bounded
//! channels between them keep memory proportional to the batch size.

pub mod runner;
pub mod validate;
pub mod worker;

pub use runner::{FileResult, PipelineRunner};
pub use validate::{ValidationReport, Validator};
pub use worker::Processor;
