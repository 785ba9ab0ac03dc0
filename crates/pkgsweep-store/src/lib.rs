pub mod ledger;
pub mod output;

pub use ledger::{LedgerError, ProgressStore, SCHEMA_VERSION};
pub use output::{OutputError, OutputManager, SystemSpaceProbe};
