use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::Bidder;

/// Include rules for one bidder: attribute name to accepted values.
#[derive(Debug, Default)]
pub struct Rules {
    pub id: String,
    items: BTreeMap<String, Vec<String>>,
}

impl Rules {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            items: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.items.entry(key.into()).or_default().push(value.into());
    }
}

/// Precomputed permutation table: every combination of attribute values maps
/// to the bidders that accept it. Keys look like
/// `device.type=4;geo.dma=618`, attributes in sorted order.
#[derive(Debug, Default)]
pub struct FilterTable {
    hash: HashMap<String, Vec<String>>,
    keys: Vec<String>,
}

impl FilterTable {
    pub fn add(&mut self, rules: &Rules) {
        let attributes: Vec<&String> = rules.items.keys().collect();
        let Some((head, tail)) = attributes.split_first() else {
            return;
        };

        self.keys = attributes.iter().map(|k| (*k).clone()).collect();
        self.permute(String::new(), head.as_str(), tail, rules);
    }

    fn permute(&mut self, prefix: String, head: &str, tail: &[&String], rules: &Rules) {
        for value in &rules.items[head] {
            match tail.split_first() {
                None => {
                    let key = format!("{prefix}{head}={value}");
                    self.hash.entry(key).or_default().push(rules.id.clone());
                }
                Some((next, rest)) => {
                    self.permute(format!("{prefix}{head}={value};"), next.as_str(), rest, rules);
                }
            }
        }
    }

    pub fn accepting(&self, key: &str) -> &[String] {
        self.hash.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hash.is_empty()
    }
}

/// Builds the table from the device-type and DMA include lists of the
/// current bidder set. Exclude lists are not supported by the permutation
/// scheme; their presence is only logged.
pub fn build_filter_table(bidders: &[Arc<Bidder>]) -> FilterTable {
    let mut table = FilterTable::default();

    for bidder in bidders {
        let mut rules = Rules::new(bidder.label());

        if let Some(device) = &bidder.descriptor.device_type {
            for include in &device.include {
                rules.add("device.type", include.to_string());
            }
            if !device.exclude.is_empty() {
                tracing::warn!(agent = bidder.label(), "device-type filter has excludes");
            }
        }

        if let Some(dma) = &bidder.descriptor.dma {
            for include in &dma.include {
                rules.add("geo.dma", include.clone());
            }
            if !dma.exclude.is_empty() {
                tracing::warn!(agent = bidder.label(), "dma filter has excludes");
            }
        }

        table.add(&rules);
    }

    table
}
