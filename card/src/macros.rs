//! Various macros used in this crate.

/// Prints formatted output to stderr if the first argument evaluates
/// to true.
///
/// Every module that wants tracing defines a `TRACE` constant, which
/// is usually false.  Flipping it turns on the module's debugging
/// output without touching the call sites.
macro_rules! trace {
    ( $TRACE:expr, $fmt:expr, $($pargs:expr),* ) => {
        if $TRACE {
            eprintln!($fmt, $($pargs),*);
        }
    };
    ( $TRACE:expr, $fmt:expr ) => {
        trace!($TRACE, $fmt, );
    };
}

/// Traces execution.
///
/// `t!(TRACE, "handler-name", "...")` prints prefixed trace output
/// when `TRACE` is set.
macro_rules! t {
    ( $TRACE:expr, $func:expr, $fmt:expr ) => {
        trace!($TRACE, "{}: {}", $func, $fmt)
    };
    ( $TRACE:expr, $func:expr, $fmt:expr, $($pargs:expr),* ) => {
        trace!($TRACE, "{}: {}", $func, format!($fmt, $($pargs),*))
    };
}
