//! Collection-scoped queries with filter, sort and limit constraints.

use super::Document;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Sorted query parameters. Feeds the cache key, so ordering must be stable.
pub type QueryParams = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    ArrayContains,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "==",
            FilterOp::Ne => "!=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::In => "in",
            FilterOp::ArrayContains => "array-contains",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn matches(&self, doc: &Document) -> bool {
        let actual = doc.get(&self.field);

        match self.op {
            FilterOp::Eq => actual.is_some_and(|v| values_equal(&v, &self.value)),
            FilterOp::Ne => !actual.is_some_and(|v| values_equal(&v, &self.value)),
            FilterOp::Lt => compare_op(actual, &self.value, |o| o == Ordering::Less),
            FilterOp::Le => compare_op(actual, &self.value, |o| o != Ordering::Greater),
            FilterOp::Gt => compare_op(actual, &self.value, |o| o == Ordering::Greater),
            FilterOp::Ge => compare_op(actual, &self.value, |o| o != Ordering::Less),
            FilterOp::In => match (&actual, &self.value) {
                (Some(v), Value::Array(candidates)) => {
                    candidates.iter().any(|c| values_equal(v, c))
                }
                _ => false,
            },
            FilterOp::ArrayContains => match actual {
                Some(Value::Array(items)) => items.iter().any(|i| values_equal(i, &self.value)),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value,
        });
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: Value) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Canonical parameters: filters are sorted (their order does not change
    /// the result), sort keys keep their order (it does).
    pub fn params(&self) -> QueryParams {
        let mut params = QueryParams::new();

        let mut filters: Vec<Value> = self
            .filters
            .iter()
            .map(|f| json!([f.field, f.op.as_str(), f.value]))
            .collect();
        filters.sort_by_key(|f| f.to_string());
        if !filters.is_empty() {
            params.insert("filters".to_string(), Value::Array(filters));
        }

        if !self.order_by.is_empty() {
            let order: Vec<String> = self
                .order_by
                .iter()
                .map(|o| format!("{} {}", o.field, o.direction.as_str()))
                .collect();
            params.insert("orderBy".to_string(), json!(order));
        }

        if let Some(limit) = self.limit {
            params.insert("limit".to_string(), json!(limit));
        }

        params
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Evaluate the query over an unordered set of documents.
    pub fn apply<I>(&self, documents: I) -> Vec<Document>
    where
        I: IntoIterator<Item = Document>,
    {
        let mut result: Vec<Document> = documents.into_iter().filter(|d| self.matches(d)).collect();

        result.sort_by(|a, b| {
            for order in &self.order_by {
                let left = a.get(&order.field).unwrap_or(Value::Null);
                let right = b.get(&order.field).unwrap_or(Value::Null);
                let ordering = total_cmp(&left, &right);
                let ordering = match order.direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.id.cmp(&b.id)
        });

        if let Some(limit) = self.limit {
            result.truncate(limit);
        }
        result
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || compare_values(a, b) == Some(Ordering::Equal)
}

fn compare_op(actual: Option<Value>, expected: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    actual
        .and_then(|v| compare_values(&v, expected))
        .is_some_and(accept)
}

/// Ordering between two values of the same JSON type; `None` across types.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order used for sorting: by type first, then by value.
fn total_cmp(a: &Value, b: &Value) -> Ordering {
    type_rank(a)
        .cmp(&type_rank(b))
        .then_with(|| compare_values(a, b).unwrap_or(Ordering::Equal))
}
