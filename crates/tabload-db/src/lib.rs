//! # Tabload DB
//!
//! Everything the pipeline does against the relational warehouse: the
//! dialect capability layer, pool construction and bootstrap DDL, the
//! lineage log, per-file stage tables and the buffered stage writer, the
//! auditor, the change-detecting publisher, and the DLQ cleaner.
//!
//! ## Dialect discipline
//!
//! All SQL differences live in [`dialect::Dialect`], a capability object
//! the rest of the crate treats as data: stage DDL, grain checks,
//! duplicate exemplars, the merge statement, DLQ batch deletes, bind
//! placeholders, and datetime rendering. Components depend on the
//! interface; the per-engine texts are just values.

pub mod audit;
pub mod dialect;
pub mod dlq;
pub mod lineage;
pub mod pool;
pub mod publish;
pub mod stage;

mod row;

pub use audit::Auditor;
pub use dialect::Dialect;
pub use dlq::DlqCleaner;
pub use lineage::LineageLog;
pub use pool::Warehouse;
pub use publish::Publisher;
pub use stage::{
    create_stage_table, drop_stage_table, sanitize_table_name, stage_table_name, StageWriter,
};
