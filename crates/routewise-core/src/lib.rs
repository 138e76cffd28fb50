//! # routewise-core
//!
//! Deterministic route selection for LLM provider traffic.
//!
//! This crate answers one question: given a request and the provider
//! catalog, in which order should (provider, model) pairs be tried?
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: same request and catalog always produce the same chain
//! 2. **No provider calls**: selection never touches the network
//! 3. **Never empty**: a chain always has at least the default pair, unless
//!    the catalog's default is blank
//!
//! ## Example
//!
//! ```rust,ignore
//! use routewise_core::{Catalog, CostMode, RequestContext, Selector};
//!
//! let catalog = Catalog::from_yaml_file("catalog.yaml")?;
//! let ctx = RequestContext::new("Compare these two designs")
//!     .with_cost_mode(CostMode::CostOptimized);
//!
//! let plan = Selector::default().select_chain(&ctx, &catalog)?;
//! for target in &plan.targets {
//!     println!("{}", target);
//! }
//! ```

pub mod catalog;
pub mod classify;
pub mod selector;
pub mod types;

// Re-export main types at crate root
pub use catalog::{
    Catalog, CatalogError, CostWeights, DefaultTarget, ModelProfile, ProviderProfile,
};
pub use classify::{classify, classify_with, estimate_tokens, normalize_query, ClassifierConfig};
pub use selector::{RoutingError, Selector, SelectorConfig};
pub use types::{
    ComplexityTier, CostMode, RequestContext, RoutePlan, Target, DEFAULT_ENDPOINT,
};

/// Select a chain with the default selector configuration.
pub fn select_chain(ctx: &RequestContext, catalog: &Catalog) -> Result<RoutePlan, RoutingError> {
    Selector::default().select_chain(ctx, catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_chain_with_defaults() {
        let plan = select_chain(&RequestContext::new("hello"), &Catalog::empty()).unwrap();
        assert_eq!(plan.head(), Some(&Target::new("openai", "gpt-4o-mini")));
    }
}
