//! Decides whether a rebalance should go ahead given the current drift.

use crate::core::basket::{Basket, BasketWeightMismatch};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use tracing::debug;

/// Fewer daily closes than this give an asset zero volatility.
pub const MIN_VOLATILITY_SAMPLES: usize = 10;

/// How the evaluator weighs drift, schedule and cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceMode {
    /// Drift threshold, with the scheduled check as a backstop.
    #[default]
    Threshold,
    Calendar,
    CostAware,
    /// Schedule or drift, each only when the cost is justified, plus an
    /// emergency breach at twice the threshold.
    Hybrid,
}

impl Display for RebalanceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RebalanceMode::Threshold => write!(f, "threshold"),
            RebalanceMode::Calendar => write!(f, "calendar"),
            RebalanceMode::CostAware => write!(f, "cost-aware"),
            RebalanceMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailPolicy {
    #[serde(default)]
    pub mode: RebalanceMode,
    /// Drift in percentage points at which a rebalance is permitted.
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: Decimal,
    /// Days after the last rebalance when a scheduled rebalance is due.
    #[serde(default = "default_check_interval_days")]
    pub check_interval_days: i64,
    /// Cost of one rebalance, used to estimate what waiting saves.
    #[serde(default = "default_assumed_cost")]
    pub assumed_rebalance_cost: Decimal,
    /// Ceiling on the estimated rebalance cost, in percent of portfolio value.
    #[serde(default = "default_max_cost_pct")]
    pub max_cost_pct: Decimal,
    #[serde(default)]
    pub max_position_weight: Option<Decimal>,
    /// Pause rebalancing while the NAV drawdown exceeds this percentage.
    #[serde(default)]
    pub max_drawdown_pct: Option<Decimal>,
    /// Annualized portfolio volatility (percent) above which a de-risked
    /// basket is suggested.
    #[serde(default)]
    pub vol_cap_pct: Option<Decimal>,
    /// Asset that absorbs the weight taken out by the volatility cap.
    #[serde(default = "default_reserve_asset")]
    pub reserve_asset: String,
}

fn default_drift_threshold() -> Decimal {
    dec!(2)
}

fn default_check_interval_days() -> i64 {
    30
}

fn default_assumed_cost() -> Decimal {
    dec!(50)
}

fn default_max_cost_pct() -> Decimal {
    dec!(0.5)
}

fn default_reserve_asset() -> String {
    "USDC".to_string()
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        GuardrailPolicy {
            mode: RebalanceMode::default(),
            drift_threshold: default_drift_threshold(),
            check_interval_days: default_check_interval_days(),
            assumed_rebalance_cost: default_assumed_cost(),
            max_cost_pct: default_max_cost_pct(),
            max_position_weight: None,
            max_drawdown_pct: None,
            vol_cap_pct: None,
            reserve_asset: default_reserve_asset(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RebalanceClock {
    pub now: DateTime<Utc>,
    pub last_rebalance: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RebalanceCost {
    pub estimated_cost: Decimal,
    pub portfolio_value: Decimal,
}

/// Market inputs beyond the weights. All optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketContext<'a> {
    /// Portfolio values, oldest first.
    pub nav_history: &'a [Decimal],
    /// Daily closes per asset, oldest first.
    pub price_history: Option<&'a BTreeMap<String, Vec<Decimal>>>,
    pub cost: Option<RebalanceCost>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolCapAdjustment {
    pub portfolio_volatility: Decimal,
    pub threshold: Decimal,
    pub adjusted_basket: Basket,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardrailDecision {
    pub permit: bool,
    pub mode: RebalanceMode,
    pub reason: String,
    pub estimated_savings: Decimal,
    /// Current minus target weight per asset, in percentage points.
    pub drifts: BTreeMap<String, Decimal>,
    pub max_drift: Decimal,
    pub warning: Option<BasketWeightMismatch>,
    /// Suggested basket when the volatility cap is breached. Advisory only.
    pub vol_cap: Option<VolCapAdjustment>,
}

pub fn evaluate(
    basket: &Basket,
    current_weights: &HashMap<String, Decimal>,
    policy: &GuardrailPolicy,
    clock: RebalanceClock,
) -> GuardrailDecision {
    evaluate_with_context(basket, current_weights, policy, clock, &MarketContext::default())
}

/// Same as [`evaluate`], additionally applying the drawdown stop, the
/// volatility cap and the cost checks to the given market context.
pub fn evaluate_with_context(
    basket: &Basket,
    current_weights: &HashMap<String, Decimal>,
    policy: &GuardrailPolicy,
    clock: RebalanceClock,
    context: &MarketContext,
) -> GuardrailDecision {
    let mut drifts: BTreeMap<String, Decimal> = basket
        .iter()
        .map(|(symbol, target)| {
            let current = current_weights.get(symbol).copied().unwrap_or_default();
            (symbol.to_string(), current - target)
        })
        .collect();
    for (symbol, current) in current_weights {
        drifts.entry(symbol.clone()).or_insert(*current);
    }
    let max_drift = drifts
        .values()
        .map(|d| d.abs())
        .max()
        .unwrap_or_default();

    let vol_cap = match (policy.vol_cap_pct, context.price_history) {
        (Some(cap), Some(history)) => check_vol_cap(basket, history, cap, &policy.reserve_asset),
        _ => None,
    };

    let decide = |permit: bool, reason: String, estimated_savings: Decimal| GuardrailDecision {
        permit,
        mode: policy.mode,
        reason,
        estimated_savings,
        drifts: drifts.clone(),
        max_drift,
        warning: basket.validate(),
        vol_cap: vol_cap.clone(),
    };

    if let Some(limit) = policy.max_drawdown_pct {
        let drawdown = max_drawdown(context.nav_history);
        if drawdown > limit {
            debug!(%drawdown, %limit, "Drawdown stop active");
            return decide(
                false,
                format!(
                    "Rebalancing paused: drawdown {}% exceeds {}%",
                    drawdown.round_dp(2),
                    limit
                ),
                Decimal::ZERO,
            );
        }
    }

    if let Some(limit) = policy.max_position_weight {
        if let Some((symbol, weight)) = basket.iter().find(|(_, w)| *w > limit) {
            return decide(
                false,
                format!("Target weight for {symbol} ({weight}%) exceeds position limit {limit}%"),
                Decimal::ZERO,
            );
        }
    }

    let threshold_breach = max_drift >= policy.drift_threshold;
    let schedule = schedule_status(&clock, policy);

    match policy.mode {
        RebalanceMode::Threshold => {
            if threshold_breach {
                return decide(
                    true,
                    format!(
                        "Drift threshold exceeded: {}% >= {}%",
                        max_drift.round_dp(2),
                        policy.drift_threshold
                    ),
                    Decimal::ZERO,
                );
            }
            if schedule.is_due() {
                return decide(true, schedule.to_string(), Decimal::ZERO);
            }
            decide(
                false,
                format!(
                    "All weights within {}% threshold (max drift {}%)",
                    policy.drift_threshold,
                    max_drift.round_dp(2)
                ),
                waiting_savings(max_drift, policy),
            )
        }
        RebalanceMode::Calendar => match schedule {
            ScheduleStatus::NotDue { days_left } => {
                decide(false, schedule.to_string(), calendar_savings(days_left))
            }
            _ => decide(true, schedule.to_string(), Decimal::ZERO),
        },
        RebalanceMode::CostAware => match context.cost {
            Some(cost) => {
                let check = cost_check(basket, &drifts, max_drift, cost, policy);
                decide(check.passes(), check.reason(), check.savings())
            }
            None => decide(false, "No cost estimate available".to_string(), Decimal::ZERO),
        },
        RebalanceMode::Hybrid => {
            let check = context
                .cost
                .map(|cost| cost_check(basket, &drifts, max_drift, cost, policy));
            let cost_ok = check.as_ref().is_some_and(CostCheck::passes);
            let emergency = policy.drift_threshold * dec!(2);

            if schedule.is_due() && cost_ok {
                decide(
                    true,
                    "Scheduled rebalance due and cost justified".to_string(),
                    Decimal::ZERO,
                )
            } else if threshold_breach && cost_ok {
                decide(
                    true,
                    "Threshold breach and cost justified".to_string(),
                    Decimal::ZERO,
                )
            } else if max_drift > emergency {
                decide(
                    true,
                    format!(
                        "Emergency rebalance: {}% drift exceeds {}%",
                        max_drift.round_dp(2),
                        emergency
                    ),
                    Decimal::ZERO,
                )
            } else if !cost_ok {
                match check {
                    Some(check) => decide(
                        false,
                        format!("Waiting: {}", check.reason()),
                        check.savings(),
                    ),
                    None => decide(
                        false,
                        "Waiting: no cost estimate available".to_string(),
                        Decimal::ZERO,
                    ),
                }
            } else {
                let savings = match schedule {
                    ScheduleStatus::NotDue { days_left } => calendar_savings(days_left),
                    _ => Decimal::ZERO,
                };
                decide(false, format!("Waiting: {schedule}"), savings)
            }
        }
    }
}

enum ScheduleStatus {
    NeverRebalanced,
    Due { days_since: i64 },
    NotDue { days_left: i64 },
}

impl ScheduleStatus {
    fn is_due(&self) -> bool {
        !matches!(self, ScheduleStatus::NotDue { .. })
    }
}

impl Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleStatus::NeverRebalanced => write!(f, "No previous rebalance recorded"),
            ScheduleStatus::Due { days_since } => {
                write!(f, "Scheduled rebalance due ({days_since} days since last)")
            }
            ScheduleStatus::NotDue { days_left } => {
                write!(f, "Next scheduled rebalance in {days_left} days")
            }
        }
    }
}

fn schedule_status(clock: &RebalanceClock, policy: &GuardrailPolicy) -> ScheduleStatus {
    let Some(last) = clock.last_rebalance else {
        return ScheduleStatus::NeverRebalanced;
    };
    let due = last + Duration::days(policy.check_interval_days);
    if clock.now >= due {
        ScheduleStatus::Due {
            days_since: (clock.now - last).num_days(),
        }
    } else {
        ScheduleStatus::NotDue {
            days_left: (due - clock.now).num_days(),
        }
    }
}

struct CostCheck {
    drift_score: Decimal,
    cost_ratio: Decimal,
    ceiling: Decimal,
    estimated_cost: Decimal,
    justified: bool,
    reasonable: bool,
}

impl CostCheck {
    fn passes(&self) -> bool {
        self.justified && self.reasonable
    }

    fn reason(&self) -> String {
        let verdict = if !self.justified {
            "Cost not justified"
        } else if !self.reasonable {
            return format!(
                "Cost too high: ${:.2} > ${:.2}",
                self.estimated_cost, self.ceiling
            );
        } else {
            "Cost justified"
        };
        format!(
            "{verdict}: {}% drift vs {}% cost",
            self.drift_score.round_dp(2),
            self.cost_ratio.round_dp(3)
        )
    }

    /// Waiting saves the whole cost only when the drift does not pay for it.
    fn savings(&self) -> Decimal {
        if self.justified {
            Decimal::ZERO
        } else {
            self.estimated_cost.round_dp(2)
        }
    }
}

fn cost_check(
    basket: &Basket,
    drifts: &BTreeMap<String, Decimal>,
    max_drift: Decimal,
    cost: RebalanceCost,
    policy: &GuardrailPolicy,
) -> CostCheck {
    let total_drift: Decimal = basket
        .symbols()
        .filter_map(|s| drifts.get(s))
        .map(|d| d.abs())
        .sum();
    let drift_score = (total_drift + max_drift * dec!(2)) / dec!(3);
    let cost_ratio = if cost.portfolio_value > Decimal::ZERO {
        cost.estimated_cost / cost.portfolio_value * dec!(100)
    } else {
        Decimal::MAX
    };
    let ceiling = cost.portfolio_value * policy.max_cost_pct / dec!(100);
    let justified = cost.portfolio_value > Decimal::ZERO && drift_score > cost_ratio * dec!(2);

    CostCheck {
        drift_score,
        cost_ratio,
        ceiling,
        estimated_cost: cost.estimated_cost,
        justified,
        reasonable: cost.estimated_cost <= ceiling,
    }
}

fn waiting_savings(max_drift: Decimal, policy: &GuardrailPolicy) -> Decimal {
    if policy.drift_threshold <= Decimal::ZERO || max_drift >= policy.drift_threshold {
        return Decimal::ZERO;
    }
    let remaining = (policy.drift_threshold - max_drift) / policy.drift_threshold;
    (policy.assumed_rebalance_cost * remaining).round_dp(2)
}

/// Up to $25 for waiting a month or more until the scheduled date.
fn calendar_savings(days_left: i64) -> Decimal {
    if days_left <= 0 {
        return Decimal::ZERO;
    }
    let factor = (Decimal::from(days_left) / dec!(30)).min(Decimal::ONE);
    (dec!(25) * factor).round_dp(2)
}

/// Largest peak-to-trough decline in percent.
pub fn max_drawdown(nav_history: &[Decimal]) -> Decimal {
    let mut peak = Decimal::ZERO;
    let mut worst = Decimal::ZERO;
    for nav in nav_history {
        if *nav > peak {
            peak = *nav;
        }
        if peak > Decimal::ZERO {
            let drawdown = (peak - nav) / peak * dec!(100);
            worst = worst.max(drawdown);
        }
    }
    worst
}

/// Annualized volatility in percent from daily closes, using the population
/// standard deviation of log returns.
pub fn annualized_volatility(prices: &[Decimal]) -> Decimal {
    if prices.len() < MIN_VOLATILITY_SAMPLES {
        return Decimal::ZERO;
    }
    let Some(closes) = prices
        .iter()
        .map(|p| p.to_f64().filter(|p| *p > 0.0))
        .collect::<Option<Vec<f64>>>()
    else {
        return Decimal::ZERO;
    };

    let returns: Vec<f64> = closes.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let annualized = variance.sqrt() * 365f64.sqrt() * 100.0;

    Decimal::from_f64(annualized)
        .map(|v| v.round_dp(4))
        .unwrap_or_default()
}

/// Weighted average of asset volatilities, ignoring correlation.
pub fn portfolio_volatility(
    basket: &Basket,
    price_history: &BTreeMap<String, Vec<Decimal>>,
) -> Decimal {
    basket
        .iter()
        .map(|(symbol, weight)| {
            let vol = price_history
                .get(symbol)
                .map(|p| annualized_volatility(p))
                .unwrap_or_default();
            weight / dec!(100) * vol
        })
        .sum()
}

fn check_vol_cap(
    basket: &Basket,
    price_history: &BTreeMap<String, Vec<Decimal>>,
    cap: Decimal,
    reserve_asset: &str,
) -> Option<VolCapAdjustment> {
    let volatility = portfolio_volatility(basket, price_history);
    if volatility <= cap {
        return None;
    }
    debug!(%volatility, %cap, "Volatility cap breached");

    // Aim 10% under the cap.
    let factor = cap * dec!(0.9) / volatility;
    let mut reserve = basket.weight(reserve_asset).unwrap_or_default();
    let mut adjusted = Basket::new();
    for (symbol, weight) in basket.iter().filter(|(s, _)| *s != reserve_asset) {
        let reduced = weight * factor;
        reserve += weight - reduced;
        adjusted.set(symbol, reduced);
    }
    adjusted.set(reserve_asset, reserve.min(dec!(100)));

    let adjusted_basket = adjusted
        .normalize()
        .iter()
        .map(|(s, w)| (s.to_string(), w.round_dp(2)))
        .collect();
    Some(VolCapAdjustment {
        portfolio_volatility: volatility.round_dp(2),
        threshold: cap,
        adjusted_basket,
    })
}
