//! Provider catalog parsing and validation.
//!
//! A catalog is structured data validated against JSON Schema, then checked
//! for cross-references (fallback chains) the schema cannot express.

mod parser;
mod schema;

pub use parser::{
    Catalog, CatalogError, CostWeights, DefaultTarget, ModelProfile, ProviderProfile,
};
pub use schema::validate_catalog_schema;
