//! Filtered, paginated document queries.
//!
//! Filters are evaluated against [`Element::field`], so structural keys
//! (`standard_id`, `x_opencti_stix_ids`, `from_id`, ...) and attributes are
//! addressed the same way. Connection filters match relationship endpoints
//! by role, id, and type.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tessera_core::dates;
use tessera_core::schema::is_empty_value;
use tessera_core::{Element, EndpointSide, IndexFamily, ObjectId};

/// Default page size when a query does not set `first`.
pub const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Gte,
    Lte,
    Exists,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    pub key: String,
    #[serde(default)]
    pub values: Vec<Value>,
    pub operator: FilterOperator,
}

impl Filter {
    pub fn matches(&self, element: &Element) -> bool {
        let field = element.field(&self.key);
        match self.operator {
            FilterOperator::Exists => field.as_ref().is_some_and(|v| !is_empty_value(v)),
            FilterOperator::Eq => match field {
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| self.values.iter().any(|v| values_equal(item, v))),
                Some(value) => self.values.iter().any(|v| values_equal(&value, v)),
                None => false,
            },
            FilterOperator::Gte => field.is_some_and(|value| {
                self.values
                    .iter()
                    .any(|v| matches!(compare(&value, v), Some(Ordering::Greater | Ordering::Equal)))
            }),
            FilterOperator::Lte => field.is_some_and(|value| {
                self.values
                    .iter()
                    .any(|v| matches!(compare(&value, v), Some(Ordering::Less | Ordering::Equal)))
            }),
        }
    }
}

/// Nested filter on relationship endpoints. `role: None` matches either side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionFilter {
    #[serde(default)]
    pub role: Option<EndpointSide>,
    #[serde(default)]
    pub ids: Vec<ObjectId>,
    #[serde(default)]
    pub types: Vec<String>,
}

impl ConnectionFilter {
    pub fn matches(&self, element: &Element) -> bool {
        let Some(connection) = &element.connection else {
            return false;
        };
        let sides: &[EndpointSide] = match &self.role {
            Some(EndpointSide::From) => &[EndpointSide::From],
            Some(EndpointSide::To) => &[EndpointSide::To],
            None => &[EndpointSide::From, EndpointSide::To],
        };
        sides.iter().any(|side| {
            let (id, entity_type) = connection.endpoint(*side);
            (self.ids.is_empty() || self.ids.contains(&id))
                && (self.types.is_empty() || self.types.iter().any(|t| t == entity_type))
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentQuery {
    #[serde(default)]
    pub families: Vec<IndexFamily>,
    /// Matches the concrete type or any parent type.
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub connections: Vec<ConnectionFilter>,
    #[serde(default)]
    pub first: Option<usize>,
    #[serde(default)]
    pub after: Option<ObjectId>,
}

impl DocumentQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn families(mut self, families: &[IndexFamily]) -> Self {
        self.families = families.to_vec();
        self
    }

    pub fn types<S: AsRef<str>>(mut self, types: &[S]) -> Self {
        self.types = types.iter().map(|t| t.as_ref().to_string()).collect();
        self
    }

    pub fn filter(mut self, key: &str, values: Vec<Value>, operator: FilterOperator) -> Self {
        self.filters.push(Filter {
            key: key.to_string(),
            values,
            operator,
        });
        self
    }

    pub fn eq(self, key: &str, value: Value) -> Self {
        self.filter(key, vec![value], FilterOperator::Eq)
    }

    pub fn connection(
        mut self,
        role: Option<EndpointSide>,
        ids: &[ObjectId],
        types: &[String],
    ) -> Self {
        self.connections.push(ConnectionFilter {
            role,
            ids: ids.to_vec(),
            types: types.to_vec(),
        });
        self
    }

    pub fn first(mut self, first: usize) -> Self {
        self.first = Some(first);
        self
    }

    pub fn after(mut self, cursor: ObjectId) -> Self {
        self.after = Some(cursor);
        self
    }

    pub fn page_size(&self) -> usize {
        self.first.unwrap_or(DEFAULT_PAGE_SIZE).max(1)
    }

    /// Whether an element satisfies every clause except pagination.
    pub fn matches(&self, element: &Element) -> bool {
        (self.families.is_empty() || self.families.contains(&element.family))
            && (self.types.is_empty() || self.types.iter().any(|t| element.is_type(t)))
            && self.filters.iter().all(|f| f.matches(element))
            && self.connections.iter().all(|c| c.matches(element))
    }
}

/// One page of results, ordered by internal id.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub elements: Vec<Element>,
    pub end_cursor: Option<ObjectId>,
    pub has_next_page: bool,
}

impl Page {
    /// Cut a page out of candidates already ordered by internal id.
    pub fn collect<I>(query: &DocumentQuery, ordered: I) -> Self
    where
        I: IntoIterator<Item = Element>,
    {
        let size = query.page_size();
        let mut elements: Vec<Element> = ordered
            .into_iter()
            .filter(|e| query.after.map_or(true, |cursor| e.internal_id > cursor))
            .filter(|e| query.matches(e))
            .take(size + 1)
            .collect();
        let has_next_page = elements.len() > size;
        elements.truncate(size);
        Self {
            end_cursor: elements.last().map(|e| e.internal_id),
            elements,
            has_next_page,
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(x), Value::String(y)) => match (dates::parse_str(x), dates::parse_str(y)) {
            (Some(dx), Some(dy)) => dx == dy,
            _ => false,
        },
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (dates::parse_str(x), dates::parse_str(y)) {
            (Some(dx), Some(dy)) => Some(dx.cmp(&dy)),
            _ => Some(x.cmp(y)),
        },
        _ => None,
    }
}
