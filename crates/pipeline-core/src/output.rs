//! Tri-valued result carrier.
//!
//! `Output<T>` is the status a term or input currently holds: a value, a
//! reason it cannot yet produce one, or a message explaining why it
//! failed. Nothing here is monotonic — a term may move freely between
//! cases as the inputs it reads change from one evaluation to the next.

use std::fmt;

/// Why a computation has not yet produced a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Active {
    /// Work is in flight (a build is running, a fetch is pending).
    Running(String),
    /// Nothing is currently running, but the last attempt is known to be
    /// stale and a rerun has been requested or would be appropriate.
    ReadyToRerun(String),
}

impl Active {
    pub fn reason(&self) -> &str {
        match self {
            Active::Running(r) | Active::ReadyToRerun(r) => r,
        }
    }
}

impl fmt::Display for Active {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Active::Running(r) => write!(f, "running: {r}"),
            Active::ReadyToRerun(r) => write!(f, "ready to rerun: {r}"),
        }
    }
}

/// A human-readable failure message. A distinct newtype (rather than a
/// bare `String`) so `Output::Error` reads the same way at every call
/// site and so a future revision can attach structured fields without
/// touching every match arm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Msg(pub String);

impl Msg {
    pub fn new(s: impl Into<String>) -> Self {
        Msg(s.into())
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Msg {
    fn from(s: String) -> Self {
        Msg(s)
    }
}

impl From<&str> for Msg {
    fn from(s: &str) -> Self {
        Msg(s.to_string())
    }
}

/// The status of a computation: a value, an in-progress/stale marker, or
/// a failure. Structural equality — two `Output`s are equal iff their
/// variant and payload match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output<T> {
    Ok(T),
    Active(Active),
    Error(Msg),
}

impl<T> Output<T> {
    pub fn ok(value: T) -> Self {
        Output::Ok(value)
    }

    pub fn active_running(reason: impl Into<String>) -> Self {
        Output::Active(Active::Running(reason.into()))
    }

    pub fn active_ready_to_rerun(reason: impl Into<String>) -> Self {
        Output::Active(Active::ReadyToRerun(reason.into()))
    }

    pub fn error(msg: impl Into<Msg>) -> Self {
        Output::Error(msg.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Output::Ok(_))
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Output::Active(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Output::Error(_))
    }

    pub fn as_ref(&self) -> Output<&T> {
        match self {
            Output::Ok(v) => Output::Ok(v),
            Output::Active(a) => Output::Active(a.clone()),
            Output::Error(m) => Output::Error(m.clone()),
        }
    }

    /// `map : (T -> U, Output<T>) -> Output<U>`. Preserves `Active`/`Error`
    /// untouched; only transforms the `Ok` payload.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Output<U> {
        match self {
            Output::Ok(v) => Output::Ok(f(v)),
            Output::Active(a) => Output::Active(a),
            Output::Error(m) => Output::Error(m),
        }
    }

    /// Short diagnostic rendering, used by analysis node labels and logs.
    /// Does not attempt to print `T` unless the caller supplies a way to;
    /// see `pp_with`.
    pub fn pp_with(&self, show: impl Fn(&T) -> String) -> String {
        match self {
            Output::Ok(v) => show(v),
            Output::Active(a) => a.to_string(),
            Output::Error(m) => format!("error: {m}"),
        }
    }
}

impl<T: fmt::Display> fmt::Display for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Ok(v) => write!(f, "{v}"),
            Output::Active(a) => write!(f, "{a}"),
            Output::Error(m) => write!(f, "error: {m}"),
        }
    }
}
