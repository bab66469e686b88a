//! Read-mostly settings passed to every processor invocation.

use toml::{Table, Value};

/// Key/value settings resolved once at startup.
///
/// Each processor receives the global table overlaid with its own table
/// from the `[processors.<id>]` configuration section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    values: Table,
}

impl Settings {
    pub fn new(values: Table) -> Self {
        Self { values }
    }

    /// Overlay processor-specific values on top of the global settings.
    pub fn merged(global: &Settings, local: Option<&Table>) -> Self {
        let mut values = global.values.clone();
        if let Some(local) = local {
            for (key, value) in local {
                values.insert(key.clone(), value.clone());
            }
        }
        Self { values }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_integer)
    }

    /// Float value, accepting integers as well.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// String list; a single string is treated as a one-element list.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}
