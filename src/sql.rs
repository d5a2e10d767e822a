use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `SELECT * FROM week`
    SelectWeek,
    /// `SELECT * FROM bookings [WHERE day = .. AND owner = ..]`
    SelectBookings {
        day: Option<String>,
        owner: Option<String>,
    },
    /// `INSERT INTO toggles (day, resource, actor) VALUES (..)`
    Toggle {
        day: String,
        resource: String,
        actor: String,
    },
    /// `DELETE FROM bookings`
    ResetWeek,
    Listen {
        channel: String,
    },
    /// `None` is `UNLISTEN *`.
    Unlisten {
        channel: Option<String>,
    },
}

const TOGGLE_COLUMNS: [&str; 3] = ["day", "resource", "actor"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(rest) = strip_keyword(trimmed, "LISTEN ") {
        let channel = channel_name(rest)?;
        return Ok(Command::Listen { channel });
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN ") {
        let channel = match rest.trim() {
            "*" => None,
            name => Some(channel_name(name)?),
        };
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "toggles" {
        return Err(SqlError::UnknownTable(table));
    }
    let values = extract_insert_values(insert)?;
    if values.len() != TOGGLE_COLUMNS.len() {
        return Err(SqlError::WrongArity("toggles", TOGGLE_COLUMNS.len(), values.len()));
    }

    // Without a column list the values are positional.
    let columns: Vec<String> = if insert.columns.is_empty() {
        TOGGLE_COLUMNS.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity("toggles", columns.len(), values.len()));
    }

    let (mut day, mut resource, mut actor) = (None, None, None);
    for (column, value) in columns.iter().zip(&values) {
        let target = match column.as_str() {
            "day" => &mut day,
            "resource" | "room" => &mut resource,
            "actor" | "user_id" => &mut actor,
            other => return Err(SqlError::Parse(format!("unknown column {other} in toggles"))),
        };
        *target = Some(parse_string(value)?);
    }

    Ok(Command::Toggle {
        day: day.ok_or(SqlError::MissingColumn("day"))?,
        resource: resource.ok_or(SqlError::MissingColumn("resource"))?,
        actor: actor.ok_or(SqlError::MissingColumn("actor"))?,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    // Slots are released by toggling; the only bulk delete is the weekly reset.
    if delete.selection.is_some() {
        return Err(SqlError::Unsupported(
            "DELETE FROM bookings takes no WHERE clause; toggle to release a slot".into(),
        ));
    }
    Ok(Command::ResetWeek)
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    match table.as_str() {
        "week" => Ok(Command::SelectWeek),
        "bookings" => {
            let (mut day, mut owner) = (None, None);
            if let Some(selection) = &select.selection {
                extract_booking_filters(selection, &mut day, &mut owner)?;
            }
            Ok(Command::SelectBookings { day, owner })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_booking_filters(
    expr: &Expr,
    day: &mut Option<String>,
    owner: &mut Option<String>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_booking_filters(inner, day, owner),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            extract_booking_filters(left, day, owner)?;
            extract_booking_filters(right, day, owner)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => match expr_column_name(left).as_deref() {
            Some("day") => {
                *day = Some(parse_string(right)?);
                Ok(())
            }
            Some("owner") | Some("user_id") | Some("actor") => {
                *owner = Some(parse_string(right)?);
                Ok(())
            }
            Some(other) => Err(SqlError::Unsupported(format!("filter on {other}"))),
            None => Err(SqlError::Parse(format!("expected column, got {left}"))),
        },
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| &sql[keyword.len()..])
}

fn channel_name(raw: &str) -> Result<String, SqlError> {
    let name = raw.trim().trim_matches('"').to_lowercase();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(SqlError::Parse(format!("bad channel name: {raw:?}")));
    }
    Ok(name)
}

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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            rows => Err(SqlError::Unsupported(format!(
                "{} rows in one toggle; send one INSERT per toggle",
                rows.len()
            ))),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
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
    MissingColumn(&'static str),
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
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
