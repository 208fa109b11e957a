use std::error::Error;
use std::fmt;

/// Wraps an [`Error`] so that its `Display` impl prints the full source chain.
///
/// `tracing::error!(%err_with_src(&e), ...)` is the idiom used throughout this codebase
/// instead of `?e` (Debug), because most errors here are built from `anyhow`/`thiserror`
/// chains where only the top-level `Display` is usually printed, hiding the cause.
pub fn err_with_src(err: &(dyn Error + 'static)) -> ErrorWithSources<'_> {
    ErrorWithSources { err }
}

pub struct ErrorWithSources<'a> {
    err: &'a (dyn Error + 'static),
}

impl fmt::Display for ErrorWithSources<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.err)?;

        let mut source = self.err.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct RootCause;

    impl fmt::Display for RootCause {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "root cause")
        }
    }

    impl Error for RootCause {}

    #[derive(Debug)]
    struct Wrapper(RootCause);

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "wrapper")
        }
    }

    impl Error for Wrapper {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn prints_full_chain() {
        let err = Wrapper(RootCause);

        assert_eq!(err_with_src(&err).to_string(), "wrapper: root cause");
    }

    #[test]
    fn single_error_has_no_trailing_colon() {
        let err = RootCause;

        assert_eq!(err_with_src(&err).to_string(), "root cause");
    }
}
