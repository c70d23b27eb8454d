//! # strand-registry
//!
//! Bidirectional mapping between semantic `(service, method)` names and the
//! short identifiers used on the wire, with pluggable generation strategies
//! and an exportable mapping document for exchange between independently
//! built peers.

pub mod registry;
pub mod strategy;

pub use registry::{MappingDocument, NameRegistry, DEFAULT_ID_LENGTH};
pub use strategy::{HashIds, IdStrategy, RandomIds, SequentialIds};
