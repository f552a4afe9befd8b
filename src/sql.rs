use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoomType {
        id: Ulid,
        name: Option<String>,
        units: u32,
    },
    DeleteRoomType {
        id: Ulid,
    },
    InsertRatePlan {
        plan: RatePlanInterval,
    },
    DeleteRatePlan {
        id: Ulid,
    },
    InsertHold {
        id: Ulid,
        room_type_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        expires_at: Ms,
    },
    DeleteHold {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        room_type_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        label: Option<String>,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectRoomTypes,
    SelectRatePlans {
        room_type_id: Ulid,
    },
    SelectHolds {
        room_type_id: Ulid,
    },
    SelectBookings {
        room_type_id: Ulid,
    },
    SelectNightlyRates {
        room_type_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    SelectQuote {
        room_type_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    SelectAvailability {
        room_type_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements in one query".into()));
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

    match table.as_str() {
        "room_types" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("room_types", 1, 0));
            }
            let name = match values.get(1) {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            let units = match values.get(2) {
                Some(expr) => parse_u32(expr)?,
                None => 1,
            };
            Ok(Command::InsertRoomType { id: parse_ulid(&values[0])?, name, units })
        }
        "rate_plans" => {
            if values.len() < 8 {
                return Err(SqlError::WrongArity("rate_plans", 8, values.len()));
            }
            Ok(Command::InsertRatePlan {
                plan: RatePlanInterval {
                    id: parse_ulid(&values[0])?,
                    room_type_id: parse_ulid(&values[1])?,
                    start_date: parse_date(&values[2])?,
                    end_date: parse_date(&values[3])?,
                    dow_mask: parse_u8(&values[4])?,
                    closed: parse_bool(&values[5])?,
                    priority: parse_i32(&values[6])?,
                    base_rate: parse_i64(&values[7])?,
                },
            })
        }
        "holds" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("holds", 5, values.len()));
            }
            Ok(Command::InsertHold {
                id: parse_ulid(&values[0])?,
                room_type_id: parse_ulid(&values[1])?,
                check_in: parse_date(&values[2])?,
                check_out: parse_date(&values[3])?,
                expires_at: parse_i64(&values[4])?,
            })
        }
        "bookings" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("bookings", 4, values.len()));
            }
            let label = match values.get(4) {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                room_type_id: parse_ulid(&values[1])?,
                check_in: parse_date(&values[2])?,
                check_out: parse_date(&values[3])?,
                label,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;
    let id = filters.ulid("id")?;

    match table.as_str() {
        "room_types" => Ok(Command::DeleteRoomType { id }),
        "rate_plans" => Ok(Command::DeleteRatePlan { id }),
        "holds" => Ok(Command::DeleteHold { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
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
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "room_types" => Ok(Command::SelectRoomTypes),
        "rate_plans" => Ok(Command::SelectRatePlans { room_type_id: filters.ulid("room_type_id")? }),
        "holds" => Ok(Command::SelectHolds { room_type_id: filters.ulid("room_type_id")? }),
        "bookings" => Ok(Command::SelectBookings { room_type_id: filters.ulid("room_type_id")? }),
        "nightly_rates" => Ok(Command::SelectNightlyRates {
            room_type_id: filters.ulid("room_type_id")?,
            check_in: filters.date("check_in")?,
            check_out: filters.date("check_out")?,
        }),
        "quote" => Ok(Command::SelectQuote {
            room_type_id: filters.ulid("room_type_id")?,
            check_in: filters.date("check_in")?,
            check_out: filters.date("check_out")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            room_type_id: filters.ulid("room_type_id")?,
            check_in: filters.date("check_in")?,
            check_out: filters.date("check_out")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column = value` pairs from a WHERE clause joined by AND.
struct Filters<'a> {
    eq: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters { eq: Vec::new() };
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                self.eq.push((col, right.as_ref()));
                Ok(())
            }
            Expr::Nested(inner) => self.collect(inner),
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn get(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.eq
            .iter()
            .find(|(c, _)| c == col)
            .map(|(_, e)| *e)
            .ok_or(SqlError::MissingFilter(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.get(col)?)
    }

    fn date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date(self.get(col)?)
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

/// First VALUES row. Multi-row inserts are refused.
fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => NaiveDate::parse_from_str(s, DATE_FORMAT)
            .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected 'YYYY-MM-DD', got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
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

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
