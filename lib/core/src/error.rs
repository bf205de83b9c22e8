//! Shared `Result` alias for layered error reports.
//!
//! Library crates return their own error enums from operation boundaries.
//! Code that has to carry a failure across several layers (the server's
//! startup path in particular) wraps those enums in a rootcause
//! [`Report`] so each layer can attach its own context.

use rootcause::Report;

/// A Result whose error is a rootcause report over context `C`.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Missing;

    impl std::fmt::Display for Missing {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "missing")
        }
    }

    impl std::error::Error for Missing {}

    fn lookup(present: bool) -> Result<u8, Missing> {
        if present { Ok(7) } else { Err(Missing.into()) }
    }

    #[test]
    fn ok_values_pass_through() {
        assert!(matches!(lookup(true), Ok(7)));
    }

    #[test]
    fn errors_become_reports() {
        let report = lookup(false).expect_err("should fail");
        assert!(report.to_string().contains("missing"));
    }
}
