//! ARIES-style crash recovery for the Granite engine.
//!
//! [`AriesRecoveryManager`] owns the dirty page table and the transaction
//! table, drives all forward-processing logging (page writes, allocations,
//! commit/abort/end, savepoints, fuzzy checkpoints), and runs the
//! analysis / redo / undo restart sequence after a crash.
//!
//! Buffer semantics are steal/no-force: dirty pages may be written out
//! before commit (the write-ahead rule makes that safe) and are not forced
//! at commit (the flushed commit record is).

mod aries;
mod table;

pub use aries::{AriesRecoveryManager, NewTransactionFn};
pub use table::TransactionTableEntry;
