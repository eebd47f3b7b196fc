// Parser error types with helpful error messages
// Carries line/column info, a source excerpt and suggestions for common mistakes

use std::fmt;

/// Detailed parse error with location and context
#[derive(Debug, Clone)]
pub struct ParseError {
    /// Error message
    pub message: String,
    /// Line number (1-indexed, 0 when unknown)
    pub line: usize,
    /// Column number (1-indexed, 0 when unknown)
    pub column: usize,
    /// Surrounding source lines
    pub context: String,
    pub suggestion: Option<String>,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// YAML syntax error
    YamlSyntax,
    /// Wrong types or missing fields
    InvalidSchema,
    UnknownField,
    InvalidValue,
    /// Top-level keyword this engine does not support
    Unsupported,
    IoError,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            context: String::new(),
            suggestion: None,
            kind: ParseErrorKind::InvalidSchema,
        }
    }

    pub fn yaml_error(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self::new(message, line, column).with_kind(ParseErrorKind::YamlSyntax)
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_kind(mut self, kind: ParseErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Attach the source lines around `self.line`
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }
        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let prefix = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, line));

            if line_num == self.line && self.column > 0 {
                let indicator = " ".repeat(self.column.saturating_sub(1)) + "^";
                context.push_str(&format!("       | {}\n", indicator));
            }
        }

        self.context = context;
        self
    }

    /// Build from a serde_yaml error raised while reading the whole document
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((1, 1));
        let suggestion = suggest_fix(&err.to_string(), source, line);

        let mut parsed = ParseError::yaml_error(format_yaml_error_message(err), line, column)
            .with_source_context(source, 2);
        parsed.suggestion = suggestion;
        parsed
    }

    /// Build from a serde_yaml error raised while reading one job entry
    ///
    /// Errors from `serde_yaml::from_value` carry no position, so the job's
    /// key line is used instead.
    pub fn from_job_error(job: &str, err: &serde_yaml::Error, source: &str) -> Self {
        let raw = err.to_string();
        let line = find_key_line(source, job).unwrap_or(0);
        let kind = if raw.contains("unknown field") {
            ParseErrorKind::UnknownField
        } else {
            ParseErrorKind::InvalidSchema
        };

        let mut parsed = ParseError::new(
            format!("job '{}': {}", job, format_yaml_error_message(err)),
            line,
            1,
        )
        .with_kind(kind)
        .with_source_context(source, 2);
        parsed.suggestion = suggest_fix(&raw, source, line);
        parsed
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;
        if self.line > 0 {
            writeln!(f, "  --> line {}:{}", self.line, self.column)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context)?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            writeln!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Result type for parser operations
pub type ParseResult<T> = Result<T, ParseError>;

/// Line (1-indexed) of a top-level `key:` entry
pub fn find_key_line(source: &str, key: &str) -> Option<usize> {
    source.lines().position(|line| {
        let trimmed = line.trim_end();
        let unquoted = trimmed
            .strip_prefix('"')
            .and_then(|rest| rest.strip_prefix(key))
            .and_then(|rest| rest.strip_prefix('"'))
            .or_else(|| {
                trimmed
                    .strip_prefix('\'')
                    .and_then(|rest| rest.strip_prefix(key))
                    .and_then(|rest| rest.strip_prefix('\''))
            })
            .or_else(|| trimmed.strip_prefix(key));
        matches!(unquoted, Some(rest) if rest.starts_with(':'))
    })
    .map(|index| index + 1)
}

/// Make serde_yaml messages easier to read
fn format_yaml_error_message(err: &serde_yaml::Error) -> String {
    let msg = err.to_string();

    if msg.contains("missing field") {
        if let Some(field) = extract_between(&msg, "missing field `", "`") {
            return format!("missing required field '{}'", field);
        }
    }

    if msg.contains("unknown field") {
        if let Some(field) = extract_between(&msg, "unknown field `", "`") {
            if let Some(expected) = extract_expected_fields(&msg) {
                return format!(
                    "unknown field '{}', expected one of: {}",
                    field,
                    expected.join(", ")
                );
            }
            return format!("unknown field '{}'", field);
        }
    }

    if msg.contains("invalid type") {
        if let (Some(found), Some(expected)) = (
            extract_between(&msg, "invalid type: ", ","),
            extract_between(&msg, "expected ", " at").or_else(|| {
                msg.find("expected ")
                    .map(|start| msg[start + "expected ".len()..].to_string())
            }),
        ) {
            return format!("expected {}, but found {}", expected, found);
        }
    }

    msg
}

fn extract_between(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}

fn extract_expected_fields(msg: &str) -> Option<Vec<String>> {
    let start = msg.find("expected one of ")? + "expected one of ".len();
    let fields_str = &msg[start..];
    let end = fields_str.find(" at").unwrap_or(fields_str.len());
    Some(
        fields_str[..end]
            .split(", ")
            .map(|s| s.trim_matches('`').to_string())
            .collect(),
    )
}

/// Suggest fixes for common mistakes
fn suggest_fix(msg: &str, source: &str, line: usize) -> Option<String> {
    let error_line = source
        .lines()
        .nth(line.saturating_sub(1))
        .unwrap_or_default();

    if error_line.starts_with('\t') {
        return Some(
            "YAML does not allow tabs for indentation. Replace tabs with spaces.".to_string(),
        );
    }

    let typo_suggestions = [
        ("before-script", "before_script"),
        ("beforescript", "before_script"),
        ("expire-in", "expire_in"),
        ("expirein", "expire_in"),
        ("allow-failure", "allow_failure"),
        ("allowfailure", "allow_failure"),
        ("scripts", "script"),
        ("rule", "rules"),
        ("artifact", "artifacts"),
        ("dependency", "dependencies"),
        ("stages", "stage"),
    ];

    if let Some(field) = extract_between(msg, "unknown field `", "`") {
        let lower = field.to_lowercase();
        for (typo, correct) in typo_suggestions {
            if lower == typo {
                return Some(format!("did you mean '{}'?", correct));
            }
        }
    }

    None
}
