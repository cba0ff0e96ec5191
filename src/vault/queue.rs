//! Default withdrawal queue
//!
//! Ordered strategy identifiers consulted, front to back, when a withdrawal
//! exceeds idle funds. Membership is unique; removal compacts the sequence.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::vault::types::Address;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultQueue {
    entries: Vec<Address>,
}

impl DefaultQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an ordered list. Returns the first duplicate on failure.
    pub fn from_ordered(ids: Vec<Address>) -> Result<Self, Address> {
        let mut seen = HashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(id) {
                return Err(id.clone());
            }
        }
        Ok(Self { entries: ids })
    }

    /// Append unless already present. Returns whether it was appended.
    pub fn push_unique(&mut self, id: &Address) -> bool {
        if self.contains(id) {
            return false;
        }
        self.entries.push(id.clone());
        true
    }

    /// Remove and compact. Returns whether it was present.
    pub fn remove(&mut self, id: &Address) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e != id);
        self.entries.len() != before
    }

    pub fn contains(&self, id: &Address) -> bool {
        self.entries.iter().any(|e| e == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[Address] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
