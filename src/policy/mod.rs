//! Privacy and policy gate: static script screening before execution,
//! and the result-release gate after it. Both operations are pure; the
//! only state is configuration.

mod release;
mod script;

pub use release::{ReleaseDecision, ReleasePolicy, blocked_payload, release};
pub use script::{Risk, ScriptReport, validate_script};
