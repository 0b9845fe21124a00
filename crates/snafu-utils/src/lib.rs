//! Error plumbing shared by the heap crates.
//!
//! [`Location`] is captured implicitly by every `snafu` error in the workspace,
//! [`Report`] renders an error with its location and `source()` chain, and
//! [`report`] turns an error that signals a violated invariant into a panic.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::{
    error::{self, Error},
    fmt,
};

use snafu::GenerateImplicitData;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors that remember where they were constructed.
pub trait Located {
    fn location(&self) -> Location;
}

pub struct Report<E> {
    error: E,
    location: Option<Location>,
}

impl<E> fmt::Debug for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.error)?;
        if let Some(loc) = &self.location {
            writeln!(f, "  at {loc}")?;
        }
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {s}")?;
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self {
            error,
            location: None,
        }
    }

    pub fn located(error: E) -> Self
    where
        E: Located,
    {
        let location = Some(error.location());
        Self { error, location }
    }
}

/// Panics with a rendered report of `err`.
///
/// Used for conditions that mean an internal invariant no longer holds, where
/// continuing would only corrupt more state.
#[track_caller]
pub fn report<E>(err: E) -> !
where
    E: error::Error + Located,
{
    let report = Report::located(err);
    panic!("Critical error occurred\n\n{report}");
}
