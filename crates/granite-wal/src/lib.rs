//! Write-ahead log for the Granite engine.
//!
//! - [`LogRecord`]: the tagged record model with undo/redo semantics and
//!   the previous-LSN chain.
//! - [`LogEntry`]: a record plus the LSN it was appended at.
//! - [`LogManager`]: the append-only, LSN-assigning log over partition 0,
//!   with an exact durability boundary and the mutable master record at
//!   LSN 0.

mod log_manager;
mod records;

pub use log_manager::{LogManager, LogScan};
pub use records::{LogEntry, LogRecord, MASTER_RECORD_LEN};
