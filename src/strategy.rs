// ABOUTME: Strategy resolver - parses per-table copy directives
// ABOUTME: Produces a closed CopyStrategy enum plus non-fatal warnings

use std::fmt;
use std::num::NonZeroU64;

use crate::error::SyncError;

/// Placeholder replaced by the column list in a query template.
pub const FIELD_LIST_PLACEHOLDER: char = '*';
/// Placeholder replaced by the bound row-count parameter in a query template.
pub const RECORD_COUNT_PLACEHOLDER: &str = "@recordCount";

const QUERY_MARKER: &str = "query:";
const FULL_RELOAD_FLAG: &str = "-fullreload";
const FIELD_SEPARATOR: char = '|';

/// How a table's working subset is selected from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyStrategy {
    /// The newest `record_count` rows by descending row id.
    RowCount {
        record_count: Option<NonZeroU64>,
        force_full_reload: bool,
    },
    /// A user-supplied SELECT with field-list and row-count placeholders.
    TemplatedQuery {
        record_count: Option<NonZeroU64>,
        template: QueryTemplate,
        force_full_reload: bool,
    },
}

impl CopyStrategy {
    pub fn record_count(&self) -> Option<NonZeroU64> {
        match self {
            CopyStrategy::RowCount { record_count, .. }
            | CopyStrategy::TemplatedQuery { record_count, .. } => *record_count,
        }
    }

    /// Explicit count, or the configured default when the directive had none.
    pub fn effective_record_count(&self, default: u64) -> u64 {
        self.record_count().map(NonZeroU64::get).unwrap_or(default)
    }

    pub fn force_full_reload(&self) -> bool {
        match self {
            CopyStrategy::RowCount {
                force_full_reload, ..
            }
            | CopyStrategy::TemplatedQuery {
                force_full_reload, ..
            } => *force_full_reload,
        }
    }

    pub fn with_forced_full_reload(self) -> Self {
        match self {
            CopyStrategy::RowCount { record_count, .. } => CopyStrategy::RowCount {
                record_count,
                force_full_reload: true,
            },
            CopyStrategy::TemplatedQuery {
                record_count,
                template,
                ..
            } => CopyStrategy::TemplatedQuery {
                record_count,
                template,
                force_full_reload: true,
            },
        }
    }
}

impl fmt::Display for CopyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = |c: &Option<NonZeroU64>| match c {
            Some(n) => n.to_string(),
            None => "default".to_string(),
        };
        match self {
            CopyStrategy::RowCount { record_count, .. } => {
                write!(f, "rows({})", count(record_count))?
            }
            CopyStrategy::TemplatedQuery { record_count, .. } => {
                write!(f, "query({})", count(record_count))?
            }
        }
        if self.force_full_reload() {
            f.write_str(" fullreload")?;
        }
        Ok(())
    }
}

/// A validated SELECT template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate(String);

impl QueryTemplate {
    /// Validate a template. It must contain the field-list placeholder.
    pub fn new(text: &str) -> Result<Self, SyncError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::parse(QUERY_MARKER, "query template is empty"));
        }
        if !text.contains(FIELD_LIST_PLACEHOLDER) {
            return Err(SyncError::parse(
                text,
                "query template must contain the field-list placeholder '*'",
            ));
        }
        Ok(Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_record_count_placeholder(&self) -> bool {
        self.0
            .to_ascii_lowercase()
            .contains(&RECORD_COUNT_PLACEHOLDER.to_ascii_lowercase())
    }

    /// Whether the template orders by `id_column` descending somewhere.
    ///
    /// Accepts quoted and table-qualified column references.
    pub fn has_descending_id_order(&self, id_column: &str) -> bool {
        let normalized = self
            .0
            .replace('"', "")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();
        let id_column = id_column.to_ascii_uppercase();

        normalized.match_indices("ORDER BY ").any(|(idx, marker)| {
            let mut words = normalized[idx + marker.len()..].split(' ');
            let column = words.next().unwrap_or_default();
            let column = column.rsplit('.').next().unwrap_or_default();
            column == id_column && words.next() == Some("DESC")
        })
    }

    /// Substitute the first field-list placeholder with `field_list` and every
    /// row-count placeholder with `count_param` (a bind marker such as `$1`).
    pub fn render(&self, field_list: &str, count_param: &str) -> String {
        let with_fields = self
            .0
            .replacen(FIELD_LIST_PLACEHOLDER, field_list, 1);
        replace_ignore_ascii_case(&with_fields, RECORD_COUNT_PLACEHOLDER, count_param)
    }
}

fn replace_ignore_ascii_case(haystack: &str, needle: &str, replacement: &str) -> String {
    let lower_haystack = haystack.to_ascii_lowercase();
    let lower_needle = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    for (idx, _) in lower_haystack.match_indices(&lower_needle) {
        out.push_str(&haystack[last..idx]);
        out.push_str(replacement);
        last = idx + needle.len();
    }
    out.push_str(&haystack[last..]);
    out
}

/// A parsed directive line: which table, and how to copy it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDirective {
    pub table: String,
    pub strategy: CopyStrategy,
    pub warnings: Vec<String>,
}

impl TableDirective {
    /// Upper-cased table name used as the lookup key everywhere.
    pub fn key(&self) -> String {
        self.table.to_ascii_uppercase()
    }
}

/// Parses directive lines of the form
/// `Table[|Count][|query:TEMPLATE] [-fullreload]`.
#[derive(Debug, Clone)]
pub struct StrategyResolver {
    id_column: String,
}

impl StrategyResolver {
    pub fn new(id_column: &str) -> Self {
        Self {
            id_column: id_column.to_string(),
        }
    }

    pub fn resolve(&self, line: &str) -> Result<TableDirective, SyncError> {
        let (body, force_full_reload) = strip_full_reload_flag(line.trim());

        let (table, rest) = match body.split_once(FIELD_SEPARATOR) {
            Some((table, rest)) => (table.trim(), Some(rest.trim())),
            None => (body.trim(), None),
        };
        if table.is_empty() {
            return Err(SyncError::parse(line.trim(), "table name is required"));
        }

        let strategy = match rest {
            None => CopyStrategy::RowCount {
                record_count: None,
                force_full_reload,
            },
            Some(rest) => {
                if let Some(template) = strip_query_marker(rest) {
                    CopyStrategy::TemplatedQuery {
                        record_count: None,
                        template: QueryTemplate::new(template)?,
                        force_full_reload,
                    }
                } else {
                    let (count_field, tail) = match rest.split_once(FIELD_SEPARATOR) {
                        Some((count, tail)) => (count.trim(), Some(tail.trim())),
                        None => (rest, None),
                    };
                    let record_count = parse_record_count(count_field)?;
                    match tail {
                        None => CopyStrategy::RowCount {
                            record_count: Some(record_count),
                            force_full_reload,
                        },
                        Some(tail) => {
                            let template = strip_query_marker(tail).ok_or_else(|| {
                                SyncError::parse(tail, "expected 'query:' after the record count")
                            })?;
                            CopyStrategy::TemplatedQuery {
                                record_count: Some(record_count),
                                template: QueryTemplate::new(template)?,
                                force_full_reload,
                            }
                        }
                    }
                }
            }
        };

        let mut warnings = Vec::new();
        if let CopyStrategy::TemplatedQuery { template, .. } = &strategy {
            if !template.has_descending_id_order(&self.id_column) {
                warnings.push(format!(
                    "Query template for {} has no ORDER BY {} DESC; the control scan and the data fetch may select different rows",
                    table, self.id_column
                ));
            }
        }

        Ok(TableDirective {
            table: table.to_string(),
            strategy,
            warnings,
        })
    }
}

fn strip_full_reload_flag(line: &str) -> (&str, bool) {
    let split = line.len().checked_sub(FULL_RELOAD_FLAG.len());
    match split {
        Some(split)
            if line.is_char_boundary(split)
                && line[split..].eq_ignore_ascii_case(FULL_RELOAD_FLAG) =>
        {
            (line[..split].trim_end(), true)
        }
        _ => (line, false),
    }
}

fn strip_query_marker(field: &str) -> Option<&str> {
    let field = field.trim_start();
    if field.len() >= QUERY_MARKER.len()
        && field.is_char_boundary(QUERY_MARKER.len())
        && field[..QUERY_MARKER.len()].eq_ignore_ascii_case(QUERY_MARKER)
    {
        Some(&field[QUERY_MARKER.len()..])
    } else {
        None
    }
}

fn parse_record_count(field: &str) -> Result<NonZeroU64, SyncError> {
    let count: u64 = field
        .parse()
        .map_err(|_| SyncError::parse(field, "expected a record count or 'query:'"))?;
    NonZeroU64::new(count).ok_or_else(|| SyncError::parse(field, "record count must be positive"))
}
