use std::error::Error;
use std::fmt;

/// Displays an error together with its chain of sources, separated by `: `.
///
/// `std`'s default `Display` for errors only shows the outermost message,
/// which hides what actually went wrong.
pub struct ErrorWithSources<'a> {
    error: &'a dyn Error,
}

pub fn err_with_src(error: &dyn Error) -> ErrorWithSources<'_> {
    ErrorWithSources { error }
}

impl fmt::Display for ErrorWithSources<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)?;

        let mut source = self.error.source();

        while let Some(error) = source {
            write!(f, ": {error}")?;
            source = error.source();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Leaf;

    impl fmt::Display for Leaf {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            "leaf".fmt(f)
        }
    }

    impl Error for Leaf {}

    #[derive(Debug)]
    struct Outer(Leaf);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            "outer".fmt(f)
        }
    }

    impl Error for Outer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn prints_the_whole_chain() {
        assert_eq!(err_with_src(&Outer(Leaf)).to_string(), "outer: leaf");
    }
}
