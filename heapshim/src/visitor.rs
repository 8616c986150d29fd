//! Edge visiting for heap records.
//!
//! Every record reports the tagged values it keeps alive through
//! [`Visitable`]; the collector and the deallocation path plug in different
//! [`Visitor`] implementations. Map words are not edges, maps are never
//! collected.

use crate::tagged::Value;

pub trait Visitor {
    fn visit_edge(&mut self, value: Value);
}

pub trait Visitable {
    fn visit_edges(&self, visitor: &mut dyn Visitor);
}

/// Collects the heap-referencing edges of one object.
#[derive(Default)]
pub(crate) struct EdgeCollector {
    pub edges: Vec<Value>,
}

impl Visitor for EdgeCollector {
    fn visit_edge(&mut self, value: Value) {
        if value.is_heap_ref() {
            self.edges.push(value);
        }
    }
}
