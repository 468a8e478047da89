//! Key-value settings store seam.
//!
//! The device keeps a handful of named scalars and one schedule blob. The
//! core only needs get-with-default and set; how values survive a power cut
//! is the implementor's problem.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

pub trait SettingsStore {
    fn get(&self, key: &str) -> Option<Value>;

    /// Persist `value` under `key`. A single call is atomic; there is no
    /// multi-key transaction.
    fn set(&mut self, key: &str, value: Value) -> Result<()>;

    fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(Value::Int(v)) => v,
            _ => default,
        }
    }

    fn get_float(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(Value::Float(v)) => v,
            Some(Value::Int(v)) => v as f64,
            _ => default,
        }
    }

    fn get_text(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(Value::Text(v)) => v,
            _ => default.to_string(),
        }
    }

    fn get_blob(&self, key: &str) -> Option<Vec<u8>> {
        match self.get(key) {
            Some(Value::Blob(v)) => Some(v),
            _ => None,
        }
    }
}

impl<T: SettingsStore + ?Sized> SettingsStore for Box<T> {
    fn get(&self, key: &str) -> Option<Value> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        (**self).set(key, value)
    }
}

/// Volatile store for tests. Counts writes so they can check what got
/// persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: HashMap<String, Value>,
    writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls served so far.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.values.insert(key.to_string(), value);
        self.writes += 1;
        Ok(())
    }
}
