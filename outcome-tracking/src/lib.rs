// Outcome tracking
// Realizes price outcomes for stored features and audits the store for
// temporal integrity before either phase runs.

pub mod guard;
pub mod recorder;

pub use guard::{GuardConfig, TemporalIntegrityGuard};
pub use recorder::{OutcomeRecorder, RecorderConfig, RecorderReport};
