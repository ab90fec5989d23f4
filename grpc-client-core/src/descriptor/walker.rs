use prost_reflect::{FieldDescriptor, Kind, MessageDescriptor};
use std::collections::HashSet;

/// Visits every field reachable from a message descriptor, following message-typed fields.
///
/// Message types already visited are skipped, so recursive schemas terminate. A walker
/// keeps its visited set between calls to [`FieldWalker::walk`].
#[derive(Debug, Default)]
pub struct FieldWalker {
    visited: HashSet<String>,
}

impl FieldWalker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls `f` on each field of `msg`. Nested message types are walked before the field
    /// that references them is reported.
    pub fn walk<F>(&mut self, msg: &MessageDescriptor, f: &mut F)
    where
        F: FnMut(&FieldDescriptor),
    {
        if !self.visited.insert(msg.full_name().to_string()) {
            return;
        }

        for field in msg.fields() {
            if let Kind::Message(nested) = field.kind() {
                self.walk(&nested, f);
            }
            f(&field);
        }
    }
}

/// Returns the sorted, de-duplicated names of every field reachable from `msg`.
///
/// Used to feed completion candidates to the interactive line reader.
pub fn field_names(msg: &MessageDescriptor) -> Vec<String> {
    let mut names = HashSet::new();
    FieldWalker::new().walk(msg, &mut |field| {
        names.insert(field.name().to_string());
    });

    let mut names: Vec<_> = names.into_iter().collect();
    names.sort();
    names
}
