// ABOUTME: Typed builder for the source-side control and data queries
// ABOUTME: Counts, tokens and ids are always bound parameters, never literals

use anyhow::Result;
use tokio_postgres::types::ToSql;

use crate::db::{FetchFilter, TableQuery};
use crate::error::SyncError;
use crate::strategy::CopyStrategy;
use crate::utils::quote_ident;

/// Parameter value for a built query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    BigInt(i64),
    Bytes(Vec<u8>),
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundSql {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl BoundSql {
    pub fn param_refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|param| match param {
                SqlParam::BigInt(value) => value as &(dyn ToSql + Sync),
                SqlParam::Bytes(value) => value as &(dyn ToSql + Sync),
            })
            .collect()
    }
}

fn record_count_param(query: &TableQuery) -> SqlParam {
    SqlParam::BigInt(i64::try_from(query.record_count).unwrap_or(i64::MAX))
}

/// `(row_id, row_version)` for the strategy's population, newest id first.
///
/// For a row-count strategy:
/// ```sql
/// SELECT "recid"::bigint AS row_id, "recversion" AS row_version
/// FROM "public"."custtable" ORDER BY "recid" DESC LIMIT $1
/// ```
/// Templates are rendered with only the id and version columns and wrapped.
pub fn control_query(query: &TableQuery) -> BoundSql {
    let table = &query.table;
    let id = quote_ident(&table.id_column);
    let version = table.version_column.as_deref().map(quote_ident);

    let sql = match &query.strategy {
        CopyStrategy::RowCount { .. } => format!(
            "SELECT {id}::bigint AS row_id, {ver} AS row_version FROM {table} ORDER BY {id} DESC LIMIT $1",
            id = id,
            ver = version.as_deref().unwrap_or("NULL::bytea"),
            table = table.qualified(),
        ),
        CopyStrategy::TemplatedQuery { template, .. } => {
            let fields = match &version {
                Some(version) => format!("{}, {}", id, version),
                None => id.clone(),
            };
            format!(
                "SELECT q.{id}::bigint AS row_id, {ver} AS row_version FROM ({inner}) AS q ORDER BY q.{id} DESC LIMIT $1",
                id = id,
                ver = version
                    .as_ref()
                    .map(|v| format!("q.{}", v))
                    .unwrap_or_else(|| "NULL::bytea".to_string()),
                inner = template.render(&fields, "$1"),
            )
        }
    };

    BoundSql {
        sql,
        params: vec![record_count_param(query)],
    }
}

/// Full rows for the strategy's population as `(row_data jsonb, row_id,
/// row_version)`, optionally narrowed to `version >= $2 AND id >= $3`.
pub fn data_query(
    query: &TableQuery,
    fields: &[String],
    filter: Option<&FetchFilter>,
) -> Result<BoundSql> {
    let table = &query.table;
    let id = quote_ident(&table.id_column);
    let version = table.version_column.as_deref().map(quote_ident);

    if filter.is_some() && version.is_none() {
        return Err(SyncError::capability(
            table.display_name(),
            "a filtered fetch needs a version-token column",
        )
        .into());
    }

    let mut select_list: Vec<String> = fields.iter().map(|f| quote_ident(f)).collect();
    let has_field = |name: &str| fields.iter().any(|f| f.eq_ignore_ascii_case(name));
    if !has_field(&table.id_column) {
        select_list.push(id.clone());
    }
    if let Some(version_column) = &table.version_column {
        if !has_field(version_column) {
            select_list.push(quote_ident(version_column));
        }
    }
    let select_list = select_list.join(", ");

    let outer_version = version
        .as_ref()
        .map(|v| format!("q.{}", v))
        .unwrap_or_else(|| "NULL::bytea".to_string());

    let sql = match &query.strategy {
        CopyStrategy::RowCount { .. } => {
            let where_clause = match (filter, &version) {
                (Some(_), Some(version)) => {
                    format!(" WHERE {} >= $2 AND {} >= $3::bigint", version, id)
                }
                _ => String::new(),
            };
            format!(
                "SELECT to_jsonb(q) AS row_data, q.{id}::bigint AS row_id, {outer_version} AS row_version \
                 FROM (SELECT {list} FROM {table}{where_clause} ORDER BY {id} DESC LIMIT $1) AS q \
                 ORDER BY q.{id} DESC",
                id = id,
                outer_version = outer_version,
                list = select_list,
                table = table.qualified(),
                where_clause = where_clause,
            )
        }
        CopyStrategy::TemplatedQuery { template, .. } => {
            let where_clause = match (filter, &version) {
                (Some(_), Some(version)) => {
                    format!(" WHERE q.{} >= $2 AND q.{} >= $3::bigint", version, id)
                }
                _ => String::new(),
            };
            format!(
                "SELECT to_jsonb(q) AS row_data, q.{id}::bigint AS row_id, {outer_version} AS row_version \
                 FROM ({inner}) AS q{where_clause} ORDER BY q.{id} DESC LIMIT $1",
                id = id,
                outer_version = outer_version,
                inner = template.render(&select_list, "$1"),
                where_clause = where_clause,
            )
        }
    };

    let mut params = vec![record_count_param(query)];
    if let Some(filter) = filter {
        params.push(SqlParam::Bytes(filter.min_token.as_bytes().to_vec()));
        params.push(SqlParam::BigInt(filter.min_id));
    }

    Ok(BoundSql { sql, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TableRef;
    use crate::strategy::QueryTemplate;
    use crate::token::VersionToken;

    fn table(version: bool) -> TableRef {
        TableRef {
            schema: "public".to_string(),
            name: "salesline".to_string(),
            id_column: "recid".to_string(),
            version_column: version.then(|| "recversion".to_string()),
        }
    }

    fn row_count_query(version: bool) -> TableQuery {
        TableQuery {
            table: table(version),
            strategy: CopyStrategy::RowCount {
                record_count: None,
                force_full_reload: false,
            },
            record_count: 1000,
        }
    }

    fn templated_query() -> TableQuery {
        TableQuery {
            table: table(true),
            strategy: CopyStrategy::TemplatedQuery {
                record_count: None,
                template: QueryTemplate::new(
                    "SELECT * FROM public.salesline WHERE dataareaid = 'usmf' ORDER BY recid DESC LIMIT @recordCount",
                )
                .unwrap(),
                force_full_reload: false,
            },
            record_count: 250,
        }
    }

    #[test]
    fn test_control_query_row_count() {
        let bound = control_query(&row_count_query(true));
        assert_eq!(
            bound.sql,
            "SELECT \"recid\"::bigint AS row_id, \"recversion\" AS row_version FROM \"public\".\"salesline\" ORDER BY \"recid\" DESC LIMIT $1"
        );
        assert_eq!(bound.params, vec![SqlParam::BigInt(1000)]);
    }

    #[test]
    fn test_control_query_without_version_column() {
        let bound = control_query(&row_count_query(false));
        assert!(bound.sql.contains("NULL::bytea AS row_version"));
    }

    #[test]
    fn test_control_query_template_only_selects_id_and_version() {
        let bound = control_query(&templated_query());
        assert!(bound
            .sql
            .contains("(SELECT \"recid\", \"recversion\" FROM public.salesline"));
        assert!(bound.sql.contains("LIMIT $1) AS q ORDER BY q.\"recid\" DESC LIMIT $1"));
        assert_eq!(bound.params, vec![SqlParam::BigInt(250)]);
    }

    #[test]
    fn test_data_query_adds_id_and_version_columns() {
        let fields = vec!["accountnum".to_string(), "name".to_string()];
        let bound = data_query(&row_count_query(true), &fields, None).unwrap();
        assert!(bound
            .sql
            .contains("SELECT \"accountnum\", \"name\", \"recid\", \"recversion\" FROM \"public\".\"salesline\" ORDER BY"));
        assert!(bound.sql.starts_with("SELECT to_jsonb(q) AS row_data"));
        assert_eq!(bound.params.len(), 1);
    }

    #[test]
    fn test_data_query_filter_is_bound() {
        let fields = vec!["recid".to_string(), "name".to_string()];
        let filter = FetchFilter {
            min_token: VersionToken::from_u64(0x10),
            min_id: 5000,
        };
        let bound = data_query(&row_count_query(true), &fields, Some(&filter)).unwrap();
        assert!(bound
            .sql
            .contains("WHERE \"recversion\" >= $2 AND \"recid\" >= $3::bigint ORDER BY \"recid\" DESC LIMIT $1"));
        assert_eq!(
            bound.params,
            vec![
                SqlParam::BigInt(1000),
                SqlParam::Bytes(vec![0, 0, 0, 0, 0, 0, 0, 0x10]),
                SqlParam::BigInt(5000),
            ]
        );
        assert_eq!(bound.param_refs().len(), 3);
    }

    #[test]
    fn test_data_query_template_filter_wraps_outside() {
        let fields = vec!["recid".to_string(), "name".to_string()];
        let filter = FetchFilter {
            min_token: VersionToken::from_u64(1),
            min_id: 1,
        };
        let bound = data_query(&templated_query(), &fields, Some(&filter)).unwrap();
        assert!(bound
            .sql
            .contains("AS q WHERE q.\"recversion\" >= $2 AND q.\"recid\" >= $3::bigint ORDER BY q.\"recid\" DESC LIMIT $1"));
        assert!(bound.sql.contains("SELECT \"recid\", \"name\", \"recversion\" FROM public.salesline"));
    }

    #[test]
    fn test_filtered_fetch_requires_version_column() {
        let filter = FetchFilter {
            min_token: VersionToken::from_u64(1),
            min_id: 1,
        };
        assert!(data_query(&row_count_query(false), &[], Some(&filter)).is_err());
    }
}
