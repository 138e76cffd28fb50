//! Token usage, estimated spend and cost limits.
//!
//! Every successful provider call is recorded against its target. Cost is
//! estimated from the catalog's per-million-token prices; targets missing
//! from the catalog are counted with zero cost. Spend is also accumulated in
//! daily and monthly windows, which the budget limits are checked against.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use routewise_core::{CostMode, ModelProfile, Target};

use crate::providers::TokenUsage;

/// Spend is accumulated in millionths of a dollar.
const MICROS_PER_USD: f64 = 1_000_000.0;

/// Spend-based routing controls and per-request limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostControl {
    /// Once estimated spend reaches this many USD, requests are routed as
    /// cost-optimized regardless of their requested mode.
    pub downgrade_after_usd: Option<f64>,

    pub budget: BudgetLimits,

    pub token_limits: TokenLimits,

    /// Completion tokens assumed for requests without `max_tokens`
    pub expected_output_tokens: u32,
}

/// USD limits. Unset limits are not enforced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    /// Largest estimated cost of a single request
    pub per_request_usd: Option<f64>,

    pub daily_usd: Option<f64>,

    pub monthly_usd: Option<f64>,

    /// UTC hour (0-23) at which the daily window starts
    pub reset_hour: u32,
}

/// Token limits per request. Unset limits are not enforced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenLimits {
    pub max_input_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub max_total_tokens: Option<u64>,
}

/// A request refused before any provider was called.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostViolation {
    #[error("input token count {tokens} exceeds limit {limit}")]
    InputTokens { tokens: u64, limit: u64 },

    #[error("output token count {tokens} exceeds limit {limit}")]
    OutputTokens { tokens: u64, limit: u64 },

    #[error("total token count {tokens} exceeds limit {limit}")]
    TotalTokens { tokens: u64, limit: u64 },

    #[error("estimated request cost ${estimated_usd:.4} exceeds per-request limit ${limit_usd:.2}")]
    PerRequest { estimated_usd: f64, limit_usd: f64 },

    #[error("daily budget exceeded: spent ${spent_usd:.2}, limit ${limit_usd:.2}")]
    Daily { spent_usd: f64, limit_usd: f64 },

    #[error("monthly budget exceeded: spent ${spent_usd:.2}, limit ${limit_usd:.2}")]
    Monthly { spent_usd: f64, limit_usd: f64 },
}

/// Token counts and estimated cost of a request about to be routed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl CostControl {
    /// Mode to route with, given the spend so far.
    pub fn effective_mode(&self, requested: CostMode, spend_usd: f64) -> CostMode {
        match self.downgrade_after_usd {
            Some(limit) if spend_usd >= limit && requested != CostMode::CostOptimized => {
                tracing::debug!(
                    spend_usd,
                    limit,
                    requested = %requested,
                    "Spend limit reached, routing cost-optimized"
                );
                CostMode::CostOptimized
            }
            _ => requested,
        }
    }

    /// Check a request against the token limits, then the budget.
    pub fn admit(
        &self,
        estimate: &RequestEstimate,
        spent: &WindowSpend,
    ) -> Result<(), CostViolation> {
        let result = self
            .token_limits
            .check(estimate.input_tokens, estimate.output_tokens)
            .and_then(|()| self.budget.check(estimate.cost_usd, spent));
        if let Err(violation) = &result {
            tracing::warn!(%violation, "Request rejected by cost control");
        }
        result
    }

    pub fn validate(&self) -> Result<(), String> {
        let amounts = [
            ("downgrade_after_usd", self.downgrade_after_usd),
            ("budget.per_request_usd", self.budget.per_request_usd),
            ("budget.daily_usd", self.budget.daily_usd),
            ("budget.monthly_usd", self.budget.monthly_usd),
        ];
        for (name, amount) in amounts {
            if let Some(amount) = amount {
                if !amount.is_finite() || amount < 0.0 {
                    return Err(format!(
                        "{} must be a non-negative amount, got {}",
                        name, amount
                    ));
                }
            }
        }
        if self.budget.reset_hour > 23 {
            return Err(format!(
                "budget.reset_hour must be between 0 and 23, got {}",
                self.budget.reset_hour
            ));
        }
        Ok(())
    }
}

impl TokenLimits {
    pub fn check(&self, input_tokens: u64, output_tokens: u64) -> Result<(), CostViolation> {
        if let Some(limit) = self.max_input_tokens {
            if input_tokens > limit {
                return Err(CostViolation::InputTokens {
                    tokens: input_tokens,
                    limit,
                });
            }
        }
        if let Some(limit) = self.max_output_tokens {
            if output_tokens > limit {
                return Err(CostViolation::OutputTokens {
                    tokens: output_tokens,
                    limit,
                });
            }
        }
        let total = input_tokens + output_tokens;
        if let Some(limit) = self.max_total_tokens {
            if total > limit {
                return Err(CostViolation::TotalTokens { tokens: total, limit });
            }
        }
        Ok(())
    }
}

impl BudgetLimits {
    /// A request is refused when its estimate alone, or the estimate on top
    /// of the current window's spend, goes over a limit.
    pub fn check(&self, estimated_usd: f64, spent: &WindowSpend) -> Result<(), CostViolation> {
        if let Some(limit) = self.per_request_usd {
            if estimated_usd > limit {
                return Err(CostViolation::PerRequest {
                    estimated_usd,
                    limit_usd: limit,
                });
            }
        }
        if let Some(limit) = self.daily_usd {
            if spent.daily_usd + estimated_usd > limit {
                return Err(CostViolation::Daily {
                    spent_usd: spent.daily_usd,
                    limit_usd: limit,
                });
            }
        }
        if let Some(limit) = self.monthly_usd {
            if spent.monthly_usd + estimated_usd > limit {
                return Err(CostViolation::Monthly {
                    spent_usd: spent.monthly_usd,
                    limit_usd: limit,
                });
            }
        }
        Ok(())
    }
}

/// Spend in the current daily and monthly windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowSpend {
    pub daily_usd: f64,
    pub monthly_usd: f64,
}

#[derive(Debug, Default)]
struct SpendWindows {
    day: Option<NaiveDate>,
    month: Option<(i32, u32)>,
    spend: WindowSpend,
}

impl SpendWindows {
    /// Start new windows when `now` has moved past the current ones.
    fn roll(&mut self, now: DateTime<Utc>, reset_hour: u32) {
        let day = (now - chrono::Duration::hours(i64::from(reset_hour))).date_naive();
        if self.day != Some(day) {
            self.day = Some(day);
            self.spend.daily_usd = 0.0;
        }

        let month = (now.year(), now.month());
        if self.month != Some(month) {
            self.month = Some(month);
            self.spend.monthly_usd = 0.0;
        }
    }
}

/// Accumulated usage for one target.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TargetUsage {
    /// Successful provider calls
    pub calls: u64,

    /// Prompt/input tokens
    pub prompt_tokens: u64,

    /// Completion/output tokens
    pub completion_tokens: u64,

    /// Estimated cost in USD
    pub estimated_cost_usd: f64,
}

impl TargetUsage {
    fn add(&mut self, usage: &TokenUsage, cost: f64) {
        self.calls += 1;
        self.prompt_tokens += u64::from(usage.prompt_tokens);
        self.completion_tokens += u64::from(usage.completion_tokens);
        self.estimated_cost_usd += cost;
    }
}

/// Usage of one target in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetUsageEntry {
    pub target: Target,
    #[serde(flatten)]
    pub usage: TargetUsage,
}

/// Usage totals at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub total: TargetUsage,
    pub per_target: Vec<TargetUsageEntry>,
    pub window: WindowSpend,
}

/// Process-wide usage tracker.
#[derive(Debug, Default)]
pub struct UsageTracker {
    per_target: RwLock<BTreeMap<Target, TargetUsage>>,
    spend_micros: AtomicU64,
    windows: Mutex<SpendWindows>,
    reset_hour: u32,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker whose daily window starts at `reset_hour` UTC.
    pub fn with_reset_hour(reset_hour: u32) -> Self {
        Self {
            reset_hour,
            ..Self::default()
        }
    }

    /// Record a successful call. Returns its estimated cost in USD.
    pub fn record(&self, target: &Target, usage: &TokenUsage, model: Option<&ModelProfile>) -> f64 {
        self.record_at(target, usage, model, Utc::now())
    }

    fn record_at(
        &self,
        target: &Target,
        usage: &TokenUsage,
        model: Option<&ModelProfile>,
        now: DateTime<Utc>,
    ) -> f64 {
        let cost = model.map_or(0.0, |m| {
            m.estimate_cost(
                u64::from(usage.prompt_tokens),
                u64::from(usage.completion_tokens),
            )
        });

        self.per_target
            .write()
            .entry(target.clone())
            .or_default()
            .add(usage, cost);
        self.spend_micros
            .fetch_add((cost * MICROS_PER_USD).round() as u64, Ordering::Relaxed);

        let mut windows = self.windows.lock();
        windows.roll(now, self.reset_hour);
        windows.spend.daily_usd += cost;
        windows.spend.monthly_usd += cost;

        cost
    }

    /// Estimated spend so far, in USD.
    pub fn spend_usd(&self) -> f64 {
        self.spend_micros.load(Ordering::Relaxed) as f64 / MICROS_PER_USD
    }

    /// Spend in the current daily and monthly windows.
    pub fn window_spend(&self) -> WindowSpend {
        self.window_spend_at(Utc::now())
    }

    fn window_spend_at(&self, now: DateTime<Utc>) -> WindowSpend {
        let mut windows = self.windows.lock();
        windows.roll(now, self.reset_hour);
        windows.spend
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let window = self.window_spend();
        let per_target = self.per_target.read();
        let mut total = TargetUsage::default();
        let entries = per_target
            .iter()
            .map(|(target, usage)| {
                total.calls += usage.calls;
                total.prompt_tokens += usage.prompt_tokens;
                total.completion_tokens += usage.completion_tokens;
                total.estimated_cost_usd += usage.estimated_cost_usd;
                TargetUsageEntry {
                    target: target.clone(),
                    usage: usage.clone(),
                }
            })
            .collect();

        UsageSnapshot {
            total,
            per_target: entries,
            window,
        }
    }

    pub fn reset(&self) {
        self.per_target.write().clear();
        self.spend_micros.store(0, Ordering::Relaxed);
        *self.windows.lock() = SpendWindows::default();
    }
}
