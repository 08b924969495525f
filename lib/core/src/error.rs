//! The `Result` alias shared by every workweave crate.
//!
//! Errors are rootcause reports over a per-crate context enum: the workflow
//! engine reports `WorkflowError`, the carrier `CarrierError` and the agents
//! `AgentError`. A lower layer's report is lifted with `From` before it is
//! returned from an upper one.

use rootcause::Report;

/// Result carrying a rootcause report with context `C`.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Missing(&'static str);

    impl fmt::Display for Missing {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} not found", self.0)
        }
    }

    impl std::error::Error for Missing {}

    fn lookup(found: bool) -> Result<u32, Missing> {
        if found {
            Ok(7)
        } else {
            Err(Missing("request").into())
        }
    }

    #[test]
    fn report_keeps_its_context() {
        assert_eq!(lookup(true).unwrap(), 7);
        let report = lookup(false).unwrap_err();
        assert!(report.to_string().contains("request not found"));
    }
}
