//! Query filters understood by every store gateway.

use crate::entity::Row;
use serde_json::Value;
use std::cmp::Ordering;

/// One predicate of a [`Filter`].
#[derive(Clone, Debug, PartialEq)]
pub enum Clause {
    /// `field = value`
    Eq(String, Value),
    /// `field_a = value_a OR field_b = value_b OR ...`
    ///
    /// An empty group matches nothing.
    AnyOf(Vec<(String, Value)>),
}

impl Clause {
    fn matches(&self, row: &Row) -> bool {
        match self {
            Clause::Eq(field, value) => row.get(field) == Some(value),
            Clause::AnyOf(options) => options
                .iter()
                .any(|(field, value)| row.get(field) == Some(value)),
        }
    }
}

/// Sort direction for [`Filter::order_asc`] and [`Filter::order_desc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Conjunction of clauses plus optional ordering and limit.
///
/// # Example
///
/// ```
/// use booking_sync::gateway::Filter;
///
/// let filter = Filter::new()
///     .eq("salon_id", "salon-1")
///     .eq("archived", false)
///     .order_desc("created_at")
///     .limit(50);
/// assert_eq!(filter.clauses().len(), 2);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<Clause>,
    order: Option<(String, Direction)>,
    limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality clause.
    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq(field.to_string(), value.into()));
        self
    }

    /// Add an OR-group clause.
    pub fn any_of(mut self, options: Vec<(String, Value)>) -> Self {
        self.clauses.push(Clause::AnyOf(options));
        self
    }

    pub fn order_desc(mut self, field: &str) -> Self {
        self.order = Some((field.to_string(), Direction::Descending));
        self
    }

    pub fn order_asc(mut self, field: &str) -> Self {
        self.order = Some((field.to_string(), Direction::Ascending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn order(&self) -> Option<(&str, Direction)> {
        self.order.as_ref().map(|(f, d)| (f.as_str(), *d))
    }

    pub fn max_rows(&self) -> Option<usize> {
        self.limit
    }

    /// True if `row` satisfies every clause.
    pub fn matches(&self, row: &Row) -> bool {
        self.clauses.iter().all(|clause| clause.matches(row))
    }

    /// Filter, order and truncate `rows`.
    ///
    /// Used by gateways that evaluate filters client-side.
    pub fn apply(&self, rows: Vec<Row>) -> Vec<Row> {
        let mut selected: Vec<Row> = rows.into_iter().filter(|row| self.matches(row)).collect();

        if let Some((field, direction)) = &self.order {
            selected.sort_by(|a, b| {
                let ord = compare_values(a.get(field), b.get(field));
                match direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Order JSON scalars; missing and `null` sort first.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_eq_and_any_of() {
        let filter = Filter::new().eq("salon_id", "s1").any_of(vec![
            ("email".to_string(), json!("a@x.com")),
            ("phone".to_string(), json!("123")),
        ]);

        assert!(filter.matches(&row(json!({"salon_id": "s1", "email": "a@x.com", "phone": "999"}))));
        assert!(filter.matches(&row(json!({"salon_id": "s1", "email": null, "phone": "123"}))));
        assert!(!filter.matches(&row(json!({"salon_id": "s2", "email": "a@x.com"}))));
        assert!(!filter.matches(&row(json!({"salon_id": "s1", "email": "b@x.com"}))));
    }

    #[test]
    fn test_empty_any_of_matches_nothing() {
        let filter = Filter::new().any_of(vec![]);
        assert!(!filter.matches(&row(json!({"id": "1"}))));
    }

    #[test]
    fn test_order_and_limit() {
        let rows = vec![
            row(json!({"id": "a", "created_at": "2024-01-01T00:00:00Z"})),
            row(json!({"id": "b", "created_at": "2024-03-01T00:00:00Z"})),
            row(json!({"id": "c", "created_at": "2024-02-01T00:00:00Z"})),
        ];

        let out = Filter::new().order_desc("created_at").limit(2).apply(rows);
        let ids: Vec<&str> = out.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}
