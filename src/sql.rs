use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertItem {
        id: Ulid,
        name: Option<String>,
        giveaway: bool,
        bounds: LeaseBounds,
    },
    DeleteItem {
        id: Ulid,
    },
    InsertUnavailability {
        id: Ulid,
        start: Ms,
        end: Ms,
        note: Option<String>,
    },
    DeleteUnavailability {
        id: Ulid,
    },
    InsertClaim {
        id: Ulid,
        item_id: Ulid,
        start: Ms,
        end: Ms,
    },
    DeleteClaim {
        id: Ulid,
    },
    /// A row in `lease_activity` asks for the transition named by `kind`.
    InsertActivity {
        claim_id: Ulid,
        kind: ActivityKind,
        window_start: Option<Ms>,
        proposal_id: Option<ProposalId>,
        note: Option<String>,
        photos: Vec<String>,
    },
    InsertAlert {
        item_id: Ulid,
    },
    DeleteAlert {
        item_id: Ulid,
    },
    DeleteNotifications {
        id: Option<Ulid>,
    },
    InsertRating {
        claim_id: Ulid,
        stars: i64,
        comment: Option<String>,
    },
    SelectItems,
    SelectClaims {
        item_id: Option<Ulid>,
    },
    SelectActivity {
        claim_id: Ulid,
    },
    SelectAvailability {
        item_id: Ulid,
    },
    SelectFreeSlots {
        item_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectUnavailability,
    SelectNotifications,
    /// Ratings received; the session user when no `user_id` is given.
    SelectRatings {
        user_id: Option<String>,
        role: Option<RatedRole>,
    },
    SelectRatingSummary {
        user_id: Option<String>,
    },
    SelectPendingRatings,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let opt = |i: usize| values.get(i);

    match table.as_str() {
        "items" => {
            let id = opt(0).ok_or(SqlError::WrongArity("items", 1, 0)).and_then(parse_ulid_expr)?;
            Ok(Command::InsertItem {
                id,
                name: opt(1).map(parse_string_or_null).transpose()?.flatten(),
                giveaway: opt(2).map(parse_bool).transpose()?.unwrap_or(false),
                bounds: LeaseBounds {
                    min_days: opt(3).map(parse_u32_or_null).transpose()?.flatten(),
                    max_days: opt(4).map(parse_u32_or_null).transpose()?.flatten(),
                },
            })
        }
        "unavailability" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("unavailability", 3, values.len()));
            }
            Ok(Command::InsertUnavailability {
                id: parse_ulid_expr(&values[0])?,
                start: parse_i64_expr(&values[1])?,
                end: parse_i64_expr(&values[2])?,
                note: opt(3).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "claims" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("claims", 4, values.len()));
            }
            Ok(Command::InsertClaim {
                id: parse_ulid_expr(&values[0])?,
                item_id: parse_ulid_expr(&values[1])?,
                start: parse_i64_expr(&values[2])?,
                end: parse_i64_expr(&values[3])?,
            })
        }
        "lease_activity" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("lease_activity", 2, values.len()));
            }
            let kind = parse_string_or_null(&values[1])?
                .ok_or(SqlError::Parse("activity type must not be NULL".into()))?;
            let photos = match opt(5).map(parse_string_or_null).transpose()?.flatten() {
                Some(json) => serde_json::from_str::<Vec<String>>(&json)
                    .map_err(|e| SqlError::Parse(format!("photos must be a JSON array of strings: {e}")))?,
                None => Vec::new(),
            };
            Ok(Command::InsertActivity {
                claim_id: parse_ulid_expr(&values[0])?,
                kind: kind.parse().map_err(SqlError::Parse)?,
                window_start: opt(2).map(parse_i64_or_null).transpose()?.flatten(),
                proposal_id: opt(3)
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten()
                    .map(|s| s.parse::<ProposalId>().map_err(|e| SqlError::Parse(format!("bad proposal id: {e}"))))
                    .transpose()?,
                note: opt(4).map(parse_string_or_null).transpose()?.flatten(),
                photos,
            })
        }
        "availability_alerts" => {
            let item_id = opt(0)
                .ok_or(SqlError::WrongArity("availability_alerts", 1, 0))
                .and_then(parse_ulid_expr)?;
            Ok(Command::InsertAlert { item_id })
        }
        "ratings" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("ratings", 2, values.len()));
            }
            Ok(Command::InsertRating {
                claim_id: parse_ulid_expr(&values[0])?,
                stars: parse_i64_expr(&values[1])?,
                comment: opt(2).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "items" => Ok(Command::DeleteItem {
            id: extract_where_eq(&delete.selection, "id")?,
        }),
        "unavailability" => Ok(Command::DeleteUnavailability {
            id: extract_where_eq(&delete.selection, "id")?,
        }),
        "claims" => Ok(Command::DeleteClaim {
            id: extract_where_eq(&delete.selection, "id")?,
        }),
        "availability_alerts" => Ok(Command::DeleteAlert {
            item_id: extract_where_eq(&delete.selection, "item_id")?,
        }),
        "notifications" => {
            let id = match &delete.selection {
                Some(_) => Some(extract_where_eq(&delete.selection, "id")?),
                None => None,
            };
            Ok(Command::DeleteNotifications { id })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }

    match table.as_str() {
        "items" => Ok(Command::SelectItems),
        "claims" => Ok(Command::SelectClaims {
            item_id: filters.item_id,
        }),
        "lease_activity" => Ok(Command::SelectActivity {
            claim_id: filters.claim_id.ok_or(SqlError::MissingFilter("claim_id"))?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            item_id: filters.item_id.ok_or(SqlError::MissingFilter("item_id"))?,
        }),
        "free_slots" => Ok(Command::SelectFreeSlots {
            item_id: filters.item_id.ok_or(SqlError::MissingFilter("item_id"))?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        "unavailability" => Ok(Command::SelectUnavailability),
        "notifications" => Ok(Command::SelectNotifications),
        "ratings" => Ok(Command::SelectRatings {
            user_id: filters.user_id,
            role: filters.role,
        }),
        "rating_summary" => Ok(Command::SelectRatingSummary {
            user_id: filters.user_id,
        }),
        "pending_ratings" => Ok(Command::SelectPendingRatings),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Equality and range predicates recognised in a WHERE clause joined by AND.
#[derive(Debug, Default)]
struct Filters {
    item_id: Option<Ulid>,
    claim_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
    user_id: Option<String>,
    role: Option<RatedRole>,
}

impl Filters {
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        let Expr::BinaryOp { left, op, right } = expr else {
            return Err(SqlError::Unsupported(format!("filter {expr}")));
        };
        let col = expr_column_name(left);
        match (op, col.as_deref()) {
            (ast::BinaryOperator::And, _) => {
                self.collect(left)?;
                self.collect(right)?;
            }
            (ast::BinaryOperator::Eq, Some("item_id")) => self.item_id = Some(parse_ulid_expr(right)?),
            (ast::BinaryOperator::Eq, Some("claim_id")) => self.claim_id = Some(parse_ulid_expr(right)?),
            (ast::BinaryOperator::GtEq, Some("start")) => self.start = Some(parse_i64_expr(right)?),
            (ast::BinaryOperator::LtEq, Some("end")) => self.end = Some(parse_i64_expr(right)?),
            (ast::BinaryOperator::Eq, Some("user_id")) => {
                self.user_id = Some(parse_string_or_null(right)?.ok_or(SqlError::MissingFilter("user_id"))?)
            }
            (ast::BinaryOperator::Eq, Some("role")) => {
                let role = parse_string_or_null(right)?.ok_or(SqlError::MissingFilter("role"))?;
                self.role = Some(role.parse().map_err(SqlError::Parse)?)
            }
            _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
        }
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_eq(selection: &Option<Expr>, column: &'static str) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter(column)),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_i64_expr(expr).map(Some)
    }
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    parse_i64_or_null(expr)?
        .map(|v| u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range"))))
        .transpose()
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
