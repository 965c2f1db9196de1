mod ledger;
mod record;

pub use ledger::JobLedger;
pub use record::{JobState, Transition};
