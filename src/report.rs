//! Console report
//!
//! The only output meant for humans on stdout. Diagnostics go through
//! `tracing` to stderr.

use crate::error::CheckFailure;
use std::io::{self, Write};

pub const START: &str = "Checking for unapplied migrations...";
pub const SUCCESS: &str = "No unapplied migrations found.";
pub const PENDING: &str =
    "Error: unapplied model changes detected. Generate and commit the missing migration before continuing.";

pub struct Reporter<W: Write> {
    out: W,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn start(&mut self) -> io::Result<()> {
        writeln!(self.out, "{}", START)?;
        self.out.flush()
    }

    pub fn success(&mut self) -> io::Result<()> {
        writeln!(self.out, "{}", SUCCESS)
    }

    pub fn failure(&mut self, failure: &CheckFailure) -> io::Result<()> {
        match failure {
            CheckFailure::PendingChangesDetected(diff) => {
                writeln!(self.out, "{}", PENDING)?;
                for change in &diff.changes {
                    writeln!(self.out, "  - {}", change.description())?;
                }
                for suggestion in &diff.suggestions {
                    writeln!(self.out, "  Suggested migration: {}", suggestion)?;
                }
            }
            CheckFailure::DiffComputationFailed(cause) => {
                writeln!(self.out, "Error: could not compute pending migrations: {}", cause)?;
            }
        }
        self.out.flush()
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}
