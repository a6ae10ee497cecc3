use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StructuredQueryError {
    #[error("query must contain a table or sql field")]
    MissingTarget,
    #[error("query must contain an operation field")]
    MissingOperation,
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("table name cannot be empty")]
    EmptyTableName,
    #[error("filter must be a JSON object")]
    FilterNotObject,
    #[error("unsupported filter operator `{operator}` on `{column}`")]
    UnsupportedOperator { column: String, operator: String },
    #[error("`$in` on `{0}` requires an array")]
    InOperandNotArray(String),
    #[error("filter value for `{0}` must be a scalar")]
    NonScalarValue(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Find,
    FindOne,
    Count,
}

impl Operation {
    pub fn parse(name: &str) -> Result<Self, StructuredQueryError> {
        match name {
            "find" => Ok(Self::Find),
            "findOne" => Ok(Self::FindOne),
            "count" => Ok(Self::Count),
            other => Err(StructuredQueryError::UnsupportedOperation(other.to_string())),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Find => "find",
            Self::FindOne => "findOne",
            Self::Count => "count",
        }
    }
}

/// A `find`/`findOne`/`count` request against one table with an optional
/// equality/comparison filter.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredQuery {
    pub table: String,
    pub operation: Operation,
    pub filter: Map<String, Value>,
}

impl StructuredQuery {
    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self, StructuredQueryError> {
        let table = payload
            .get("table")
            .and_then(Value::as_str)
            .ok_or(StructuredQueryError::MissingTarget)?;
        if table.trim().is_empty() {
            return Err(StructuredQueryError::EmptyTableName);
        }
        let operation = payload
            .get("operation")
            .and_then(Value::as_str)
            .ok_or(StructuredQueryError::MissingOperation)
            .and_then(Operation::parse)?;
        let filter = match payload.get("filter") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(filter)) => filter.clone(),
            Some(_) => return Err(StructuredQueryError::FilterNotObject),
        };

        Ok(Self {
            table: table.trim().to_string(),
            operation,
            filter,
        })
    }

    /// Renders the statement with one `?` placeholder per filter value; the
    /// values travel separately in [`BoundQuery::params`].
    pub fn to_sql(&self) -> Result<BoundQuery, StructuredQueryError> {
        let table = qualified_table_sql(&self.table);
        let mut params = Vec::new();
        let where_clause = where_clause_sql(&self.filter, &mut params)?;
        let sql = match self.operation {
            Operation::Find => format!("SELECT * FROM {table}{where_clause}"),
            Operation::FindOne => format!("SELECT * FROM {table}{where_clause} LIMIT 1"),
            Operation::Count => format!("SELECT COUNT(*) AS count FROM {table}{where_clause}"),
        };
        Ok(BoundQuery { sql, params })
    }
}

/// A statement with positional placeholders and the scalar values bound to
/// them, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

#[must_use]
pub fn quote_identifier(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

/// `schema.table` quotes each part separately.
fn qualified_table_sql(table: &str) -> String {
    table
        .split('.')
        .map(|part| quote_identifier(part.trim()))
        .collect::<Vec<_>>()
        .join(".")
}

fn bind(column: &str, value: &Value, params: &mut Vec<Value>) -> Result<(), StructuredQueryError> {
    match value {
        Value::Array(_) | Value::Object(_) => {
            Err(StructuredQueryError::NonScalarValue(column.to_string()))
        }
        scalar => {
            params.push(scalar.clone());
            Ok(())
        }
    }
}

fn comparison_sql(
    column: &str,
    operator: &str,
    operand: &Value,
    params: &mut Vec<Value>,
) -> Result<String, StructuredQueryError> {
    let quoted = quote_identifier(column);
    let symbol = match operator {
        "$gt" => ">",
        "$gte" => ">=",
        "$lt" => "<",
        "$lte" => "<=",
        "$ne" if operand.is_null() => return Ok(format!("{quoted} IS NOT NULL")),
        "$ne" => "!=",
        "$in" => {
            let items = operand
                .as_array()
                .ok_or_else(|| StructuredQueryError::InOperandNotArray(column.to_string()))?;
            if items.is_empty() {
                return Ok("1 = 0".to_string());
            }
            for item in items {
                bind(column, item, params)?;
            }
            let placeholders = vec!["?"; items.len()].join(", ");
            return Ok(format!("{quoted} IN ({placeholders})"));
        }
        other => {
            return Err(StructuredQueryError::UnsupportedOperator {
                column: column.to_string(),
                operator: other.to_string(),
            })
        }
    };
    bind(column, operand, params)?;
    Ok(format!("{quoted} {symbol} ?"))
}

/// Scalars compare for equality; operator objects expand to one condition per
/// operator. Every condition is joined with `AND` in key order.
fn where_clause_sql(
    filter: &Map<String, Value>,
    params: &mut Vec<Value>,
) -> Result<String, StructuredQueryError> {
    let mut conditions = Vec::new();
    for (column, value) in filter {
        match value {
            Value::Object(operators) => {
                for (operator, operand) in operators {
                    conditions.push(comparison_sql(column, operator, operand, params)?);
                }
            }
            Value::Null => conditions.push(format!("{} IS NULL", quote_identifier(column))),
            scalar => {
                bind(column, scalar, params)?;
                conditions.push(format!("{} = ?", quote_identifier(column)));
            }
        }
    }

    if conditions.is_empty() {
        Ok(String::new())
    } else {
        Ok(format!(" WHERE {}", conditions.join(" AND ")))
    }
}
