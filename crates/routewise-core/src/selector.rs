//! Routing selector: turns a request and a catalog into an ordered chain.
//!
//! Selection is a pure function of `(RequestContext, Catalog, SelectorConfig)`.
//! Every comparison ends in a total order (priority, then provider name,
//! then model name), so identical inputs always yield identical chains.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use thiserror::Error;

use crate::catalog::{Catalog, CostWeights, ModelProfile, ProviderProfile};
use crate::classify::{classify_with, ClassifierConfig};
use crate::types::{ComplexityTier, CostMode, RequestContext, RoutePlan, Target};

/// Errors from route selection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    #[error("No provider available: {0}")]
    NoProviderAvailable(String),
}

/// Selector tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SelectorConfig {
    /// Complexity bucket thresholds
    pub classifier: ClassifierConfig,

    /// How input and output prices are blended
    pub cost_weights: CostWeights,

    /// Strength of the cost penalty in balanced mode.
    ///
    /// Balanced score is `quality / (1 + weight * normalized_cost)`.
    pub balanced_cost_weight: f64,

    /// Append the other ranked providers when the head has no fallback chain
    pub auto_fallback: bool,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierConfig::default(),
            cost_weights: CostWeights::default(),
            balanced_cost_weight: 1.0,
            auto_fallback: true,
        }
    }
}

/// A ranked (provider, model) candidate.
#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    provider: &'a ProviderProfile,
    model: &'a ModelProfile,
}

impl Candidate<'_> {
    fn target(&self) -> Target {
        Target::new(&self.provider.name, &self.model.name)
    }
}

/// Computes ordered fallback chains.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    config: SelectorConfig,
}

impl Selector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Classify a query with this selector's thresholds.
    pub fn classify(&self, query: &str) -> ComplexityTier {
        classify_with(query, &self.config.classifier)
    }

    /// Compute the ordered chain of attempts for a request.
    ///
    /// The chain is never empty: when nothing matches, the catalog's default
    /// pair is returned. Only a blank default pair yields an error.
    pub fn select_chain(
        &self,
        ctx: &RequestContext,
        catalog: &Catalog,
    ) -> Result<RoutePlan, RoutingError> {
        let complexity = self.classify(&ctx.query);
        let mode = ctx.cost_mode;

        if let Some(plan) = self.explicit_plan(ctx, catalog, complexity) {
            return Ok(plan);
        }

        let mut candidates = self.tier_candidates(catalog, complexity, ctx.requested_provider.as_deref());
        if candidates.is_empty() && ctx.requested_provider.is_some() {
            tracing::debug!(
                provider = ?ctx.requested_provider,
                tier = %complexity,
                "Requested provider has no eligible model, ranking whole catalog"
            );
            candidates = self.tier_candidates(catalog, complexity, None);
        }

        self.rank(&mut candidates, mode);

        let Some(head) = candidates.first().copied() else {
            return self.default_plan(catalog, complexity);
        };

        let mut targets = vec![head.target()];
        if head.provider.fallback_chain.is_empty() && self.config.auto_fallback {
            let mut seen_providers = HashSet::from([head.provider.name.as_str()]);
            for candidate in &candidates[1..] {
                if seen_providers.insert(candidate.provider.name.as_str()) {
                    targets.push(candidate.target());
                }
            }
        } else {
            self.append_fallbacks(&mut targets, head.provider, catalog, complexity, mode);
        }

        tracing::debug!(
            tier = %complexity,
            mode = %mode,
            head = %targets[0],
            chain_len = targets.len(),
            "Selected route"
        );

        Ok(RoutePlan {
            complexity,
            targets,
            used_default: false,
        })
    }

    /// The best model a provider offers for a tier under a cost mode.
    pub fn best_model<'a>(
        &self,
        provider: &'a ProviderProfile,
        tier: ComplexityTier,
        mode: CostMode,
    ) -> Option<&'a ModelProfile> {
        let mut candidates: Vec<Candidate<'a>> = provider
            .models_for_tier(tier)
            .into_iter()
            .map(|model| Candidate { provider, model })
            .collect();
        self.rank(&mut candidates, mode);
        candidates.first().map(|c| c.model)
    }

    /// Plan for requests that pin a model (with or without a provider).
    fn explicit_plan(
        &self,
        ctx: &RequestContext,
        catalog: &Catalog,
        complexity: ComplexityTier,
    ) -> Option<RoutePlan> {
        let model = ctx.requested_model.as_deref()?;

        let provider_name = match ctx.requested_provider.as_deref() {
            Some(provider) => provider.to_string(),
            None => {
                // Model only: pin the best-ranked enabled provider serving it.
                let mut offering: Vec<&ProviderProfile> = catalog
                    .enabled_providers()
                    .filter(|p| p.model(model).is_some())
                    .collect();
                offering.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
                match offering.first() {
                    Some(p) => p.name.clone(),
                    None => {
                        tracing::debug!(model, "Requested model not in catalog, ignoring pin");
                        return None;
                    }
                }
            }
        };

        let tier = catalog
            .model(&provider_name, model)
            .map(|m| m.complexity_tier)
            .unwrap_or(complexity);

        let mut targets = vec![Target::new(&provider_name, model)];
        match catalog.provider(&provider_name) {
            Some(provider) => {
                self.append_fallbacks(&mut targets, provider, catalog, tier, ctx.cost_mode);
            }
            None => {
                tracing::debug!(provider = %provider_name, "Requested provider not in catalog");
            }
        }

        Some(RoutePlan {
            complexity,
            targets,
            used_default: false,
        })
    }

    /// Resolve `owner.fallback_chain` to each fallback's best model for `tier`.
    fn append_fallbacks(
        &self,
        targets: &mut Vec<Target>,
        owner: &ProviderProfile,
        catalog: &Catalog,
        tier: ComplexityTier,
        mode: CostMode,
    ) {
        for name in &owner.fallback_chain {
            let Some(provider) = catalog.provider(name).filter(|p| p.enabled) else {
                tracing::debug!(provider = %name, "Skipping unknown or disabled fallback");
                continue;
            };
            match self.best_model(provider, tier, mode) {
                Some(model) => {
                    let target = Target::new(&provider.name, &model.name);
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
                None => {
                    tracing::debug!(provider = %name, tier = %tier, "Fallback has no model for tier");
                }
            }
        }
    }

    fn tier_candidates<'a>(
        &self,
        catalog: &'a Catalog,
        tier: ComplexityTier,
        only_provider: Option<&str>,
    ) -> Vec<Candidate<'a>> {
        catalog
            .enabled_providers()
            .filter(|p| only_provider.map_or(true, |name| p.name == name))
            .flat_map(|provider| {
                provider
                    .models_for_tier(tier)
                    .into_iter()
                    .map(move |model| Candidate { provider, model })
            })
            .collect()
    }

    fn default_plan(
        &self,
        catalog: &Catalog,
        complexity: ComplexityTier,
    ) -> Result<RoutePlan, RoutingError> {
        let target = catalog.default.to_target().ok_or_else(|| {
            RoutingError::NoProviderAvailable(
                "no catalog model matches and no default provider is configured".to_string(),
            )
        })?;

        tracing::info!(
            tier = %complexity,
            target = %target,
            "No catalog match, using default provider"
        );

        Ok(RoutePlan {
            complexity,
            targets: vec![target],
            used_default: true,
        })
    }

    /// Sort candidates best-first for a cost mode.
    fn rank(&self, candidates: &mut [Candidate<'_>], mode: CostMode) {
        let weights = self.config.cost_weights;
        let max_cost = candidates
            .iter()
            .map(|c| c.model.blended_cost(&weights))
            .fold(0.0_f64, f64::max);
        let penalty = self.config.balanced_cost_weight;

        let balanced = |c: &Candidate<'_>| {
            let normalized = if max_cost > 0.0 {
                c.model.blended_cost(&weights) / max_cost
            } else {
                0.0
            };
            c.model.quality_score / (1.0 + penalty * normalized)
        };

        candidates.sort_by(|a, b| {
            let primary = match mode {
                CostMode::CostOptimized => a
                    .model
                    .blended_cost(&weights)
                    .total_cmp(&b.model.blended_cost(&weights)),
                CostMode::QualityOptimized => b.model.quality_score.total_cmp(&a.model.quality_score),
                CostMode::Balanced => balanced(b).total_cmp(&balanced(a)),
            };
            primary.then_with(|| tie_break(a, b))
        });
    }
}

fn tie_break(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    a.provider
        .priority
        .cmp(&b.provider.priority)
        .then_with(|| a.provider.name.cmp(&b.provider.name))
        .then_with(|| a.model.name.cmp(&b.model.name))
}
