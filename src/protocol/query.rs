//! Query Parameters
//!
//! Accumulating builder for `{kind}.query` calls: filter triples plus
//! paging, ordering and field selection options.

use serde_json::{Map, Value};

/// Parameters for a list query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    /// `(field, operator, value)` triples, AND-ed by the appliance
    pub filters: Vec<(String, String, Value)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Return the number of matches instead of the rows
    pub count: bool,
    /// Ordering fields; a leading `-` sorts descending
    pub order_by: Vec<String>,
    /// Fields to return
    pub select: Vec<String>,
    /// Extra query options passed through verbatim
    pub options: Map<String, Value>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter triple
    pub fn filter(
        mut self,
        field: impl Into<String>,
        operator: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.filters.push((field.into(), operator.into(), value.into()));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn count(mut self) -> Self {
        self.count = true;
        self
    }

    pub fn order_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order_by.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Set an extra query option
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Filter list in wire form: `[[field, op, value], ...]`
    pub fn filters_value(&self) -> Value {
        Value::Array(
            self.filters
                .iter()
                .map(|(field, op, value)| {
                    Value::Array(vec![
                        Value::String(field.clone()),
                        Value::String(op.clone()),
                        value.clone(),
                    ])
                })
                .collect(),
        )
    }

    /// Query options in wire form; empty when nothing was set
    pub fn options_value(&self) -> Map<String, Value> {
        let mut options = self.options.clone();
        if let Some(limit) = self.limit.filter(|l| *l > 0) {
            options.insert("limit".into(), limit.into());
        }
        if let Some(offset) = self.offset.filter(|o| *o > 0) {
            options.insert("offset".into(), offset.into());
        }
        if self.count {
            options.insert("count".into(), true.into());
        }
        if !self.order_by.is_empty() {
            options.insert("order_by".into(), self.order_by.clone().into());
        }
        if !self.select.is_empty() {
            options.insert("select".into(), self.select.clone().into());
        }
        options
    }

    /// Positional call arguments: `[filters]` or `[filters, options]`
    pub fn to_args(&self) -> Value {
        let mut args = vec![self.filters_value()];
        let options = self.options_value();
        if !options.is_empty() {
            args.push(Value::Object(options));
        }
        Value::Array(args)
    }
}
