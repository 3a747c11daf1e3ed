//! Batch compilation of quote files into workflows.
//!
//! A [`BatchJob`] (file list plus configuration map) is compiled by the
//! [`BatchCompiler`] into a fixed-shape workflow of prepare, validate,
//! consolidate, process and finalize tasks. The tasks run through handlers
//! registered with the engine, which delegate per-file work to a
//! [`QuoteProcessor`].

mod compiler;
mod handlers;
mod job;
mod processor;
mod settings;

pub use compiler::{BatchCompiler, ScheduleState, DEFAULT_BATCH_NAME};
pub use handlers::{
    register_batch_handlers, CONSOLIDATE_HANDLER, FINALIZE_HANDLER, PREPARE_HANDLER,
    PROCESS_HANDLER, VALIDATE_HANDLER,
};
pub use job::{BatchJob, ConfigMap};
pub use processor::{FileCheck, FileCheckProcessor, QuoteProcessor};
pub use settings::{BatchSettings, DEFAULT_GROUP_SIZE, DEFAULT_GROUP_THRESHOLD};
