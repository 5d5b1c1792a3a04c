//! Resource graph model.
//!
//! This module turns declarations into a validated dependency graph:
//! - Parsing `${resource.attribute}` references out of property values
//! - Inferring dependencies from references and `depends_on`
//! - Rejecting cycles before any planning happens
//! - Walking resources in topological order

mod dag;
mod resource;
mod value;

pub use dag::{ResourceGraph, TopoIter};
pub use resource::{PropertyReference, Resource};
pub use value::{
    Properties, Reference, Segment, Template, TemplateError, collect_references,
    resolve_properties, resolve_value,
};
