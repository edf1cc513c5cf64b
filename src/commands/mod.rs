pub mod resync;
pub mod run;
pub mod status;
pub mod verify;

use crate::error::{ArchiveError, ArchiveErrorCode};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn coded_issue(&mut self, code: ArchiveErrorCode, text: impl std::fmt::Display) {
        self.issue(format!("{}: {text}", code.as_str()));
    }

    pub fn archive_error(&mut self, err: &ArchiveError) {
        self.coded_issue(err.code(), err);
    }
}
