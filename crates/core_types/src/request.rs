use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// Named values attached to a request as it moves through side-services.
/// The bid engine attaches the parsed body under `"fields"`; the risk
/// client attaches its parsed response under its target name.
#[derive(Debug, Default, Clone)]
pub struct Components {
    items: HashMap<String, Arc<Value>>,
}

impl Components {
    pub fn component(&self, name: &str) -> Option<&Arc<Value>> {
        self.items.get(name)
    }

    pub fn attach(&mut self, name: impl Into<String>, value: Arc<Value>) {
        self.items.insert(name.into(), value);
    }
}

/// Walks a JSON value along `path`. Array segments are decimal indexes.
pub fn extract<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
