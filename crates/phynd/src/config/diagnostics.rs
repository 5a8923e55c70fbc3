use std::collections::HashSet;
use std::ops::Range;
use std::path::PathBuf;

use ariadne::Color;
use ariadne::Label;
use ariadne::Report;
use ariadne::ReportKind;
use ariadne::Source;

/// Source information for where a diagnostic came from
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub file_path: PathBuf,
    pub content: String,
}

/// A diagnostic message that can be either a warning or an error
#[derive(Debug, Clone)]
pub enum Diagnostic {
    Warning(Warning),
    Error(Error),
}

/// Warning messages that don't prevent config loading
#[derive(Debug, Clone)]
pub enum Warning {
    EmptyConfig { file_path: PathBuf },
}

/// Error messages that indicate problems with the config
#[derive(Debug, Clone)]
pub enum Error {
    Merge(MergeError),
    Validation(ValidationError),
}

/// A field set in more than one file.
#[derive(Debug, Clone)]
pub struct MergeError {
    pub field_path: String,
    pub message: String,
    pub conflicts: Vec<MergeConflictLocation>,
}

/// Where a field was set.
#[derive(Debug, Clone)]
pub struct MergeConflictLocation {
    pub file_path: PathBuf,
    pub span: Range<usize>,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field_path: String,
    pub message: String,
    /// Where the offending value was written, if it was written at all.
    pub location: Option<MergeConflictLocation>,
}

/// Failure to read the config files at all.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to read '{}': {error}", path.display())]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },

    #[error("Failed to parse '{}': {error}", path.display())]
    Parse {
        path: PathBuf,
        error: toml::de::Error,
    },

    #[error("Import cycle detected at '{}': involves {} file(s)", path.display(), cycle.len())]
    ImportCycle { path: PathBuf, cycle: Vec<PathBuf> },
}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        matches!(self, Diagnostic::Error(_))
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Diagnostic::Warning(_))
    }
}

fn file_id(location: &MergeConflictLocation) -> String {
    location.file_path.to_string_lossy().to_string()
}

fn write_merge_error(merge_error: &MergeError, output: &mut Vec<u8>) {
    let Some(first) = merge_error.conflicts.first() else {
        return;
    };

    let mut report = Report::build(ReportKind::Error, (file_id(first), first.span.clone()))
        .with_message(format!("Merge conflict in field '{}'", merge_error.field_path))
        .with_note(&merge_error.message);

    for (idx, conflict) in merge_error.conflicts.iter().enumerate() {
        let (label_msg, color) = if idx == 0 {
            ("first definition here", Color::Red)
        } else {
            ("conflicts with this definition", Color::Yellow)
        };
        report = report.with_label(
            Label::new((file_id(conflict), conflict.span.clone()))
                .with_message(label_msg)
                .with_color(color),
        );
    }

    let finished = report.finish();
    let mut written = HashSet::new();
    for conflict in &merge_error.conflicts {
        let id = file_id(conflict);
        if written.insert(id.clone()) {
            finished
                .write((id, Source::from(&conflict.content)), &mut *output)
                .ok();
        }
    }
}

fn write_validation_error(error: &ValidationError, output: &mut Vec<u8>) {
    let Some(location) = &error.location else {
        let msg = format!(
            "Validation error in '{}': {}\n",
            error.field_path, error.message
        );
        output.extend_from_slice(msg.as_bytes());
        return;
    };

    Report::build(ReportKind::Error, (file_id(location), location.span.clone()))
        .with_message(format!(
            "Invalid value for '{}': {}",
            error.field_path, error.message
        ))
        .with_label(
            Label::new((file_id(location), location.span.clone()))
                .with_message(&error.message)
                .with_color(Color::Red),
        )
        .finish()
        .write(
            (file_id(location), Source::from(&location.content)),
            &mut *output,
        )
        .ok();
}

/// Format all diagnostics for display using Ariadne
pub fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    let mut output = Vec::new();

    for diagnostic in diagnostics {
        match diagnostic {
            Diagnostic::Warning(Warning::EmptyConfig { file_path }) => {
                let msg = format!(
                    "Warning: Config file '{}' is empty and has no effect\n",
                    file_path.display()
                );
                output.extend_from_slice(msg.as_bytes());
            }
            Diagnostic::Error(Error::Merge(merge_error)) => {
                write_merge_error(merge_error, &mut output);
            }
            Diagnostic::Error(Error::Validation(validation_error)) => {
                write_validation_error(validation_error, &mut output);
            }
        }
    }

    String::from_utf8_lossy(&output).to_string()
}
