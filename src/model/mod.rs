//! Resource model.
//!
//! Typed description of desired resources: their type tag, logical name,
//! property bag, and explicit or inferred dependencies.

mod resource;
mod value;

pub use resource::{Declaration, ProviderOverrides, ResourceNode, ResourceRef, redact_properties};
pub use value::{MASK, OutputReference, Value};
