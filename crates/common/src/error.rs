use thiserror::Error;

/// Error kinds shared by every crate in the gateway. Variants correspond
/// 1:1 to the taxonomy each component is specified against; adapters that
/// need to carry a foreign error use [`Error::other`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error("malformed inbound payload: {0}")]
    Validation(String),

    #[error("channel lifecycle error: {0}")]
    ChannelLifecycle(String),

    #[error("channel is not running")]
    ChannelNotRunning,

    #[error("no active endpoint for session")]
    NoRoute,

    #[error("circuit open for channel {0}")]
    CircuitOpen(String),

    #[error("callback error: {0}")]
    Callback(String),

    #[error("shutdown deadline elapsed with in-flight requests remaining")]
    ShutdownTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[source] anyhow::Error),
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    #[must_use]
    pub fn other(source: impl Into<anyhow::Error>) -> Self {
        Self::Other(source.into())
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Shared context trait ────────────────────────────────────────────────────

/// Trait for error types that can be constructed from a plain message string.
///
/// Implement this for your crate's error type, then invoke [`impl_context!`]
/// in your error module to get `.context()` and `.with_context()` on `Result`
/// and `Option`.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Generate a crate-local `Context` trait with `.context()` and
/// `.with_context()` methods on `Result` and `Option`.
///
/// Invoke inside a module that defines `Error: FromMessage` and
/// `type Result<T> = std::result::Result<T, Error>`.
///
/// ```ignore
/// // in crates/foo/src/error.rs
/// relaygate_common::impl_context!();
/// ```
#[macro_export]
macro_rules! impl_context {
    () => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> Result<T>;
            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                let ctx = context.into();
                self.map_err(|source| {
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|source| {
                    let ctx = f().into();
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(context.into()))
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    impl_context!();

    #[test]
    fn context_wraps_foreign_error() {
        let res: std::result::Result<(), std::num::ParseIntError> = "x".parse::<i32>().map(|_| ());
        let wrapped = res.context("parsing count");
        assert!(matches!(wrapped, Err(Error::Message(m)) if m.starts_with("parsing count: ")));
    }

    #[test]
    fn option_context_is_none_message() {
        let none: Option<i32> = None;
        let wrapped = none.context("missing value");
        assert!(matches!(wrapped, Err(Error::Message(m)) if m == "missing value"));
    }
}
