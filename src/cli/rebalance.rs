use super::ui;
use crate::core::config::AppConfig;
use crate::core::guardrail::{self, GuardrailDecision};
use crate::core::price::{Asset, Quote};
use crate::core::simulator::{self, RebalancePlan};
use crate::core::tax::{self, Sale, TaxLotSelection, TaxSummary};
use crate::providers::QuoteService;
use anyhow::Result;
use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color};
use std::collections::HashMap;
use tracing::{info, warn};

/// Everything a rebalance run produces, kept separate from rendering.
#[derive(Debug)]
pub struct RebalanceReport {
    pub decision: GuardrailDecision,
    pub plan: RebalancePlan,
    pub selections: Vec<TaxLotSelection>,
    /// Sells whose lots could not be selected, with the reason.
    pub tax_errors: Vec<(String, String)>,
    pub failed_selections: u64,
    pub tax: TaxSummary,
}

/// Assets to quote: the basket plus anything still held outside it.
pub fn assets_to_quote(config: &AppConfig) -> Vec<Asset> {
    let mut assets = config.basket_assets();
    for lot in config.portfolio.lots.iter().filter(|l| !l.is_retired()) {
        if !assets.iter().any(|a| a.symbol == lot.asset) {
            assets.push(
                config
                    .asset(&lot.asset)
                    .cloned()
                    .unwrap_or_else(|| Asset::new(&lot.asset)),
            );
        }
    }
    assets
}

pub fn build_report(
    config: &AppConfig,
    quotes: &HashMap<String, Quote>,
    now: DateTime<Utc>,
) -> Result<RebalanceReport> {
    let portfolio = &config.portfolio;
    let session = portfolio.session();

    let weights = simulator::current_weights(&session, quotes)?;
    let plan = simulator::simulate(&session, quotes, &config.cost_model())?;
    let decision = guardrail::evaluate_with_context(
        &session.basket,
        &weights,
        &config.guardrail,
        portfolio.clock(now),
        &portfolio.market_context(plan.total_slippage),
    );
    info!(
        permit = decision.permit,
        mode = %decision.mode,
        reason = %decision.reason,
        "Guardrail evaluated"
    );

    let mut selections = Vec::new();
    let mut tax_errors = Vec::new();
    let mut failed_selections = 0;
    for trade in plan.sells() {
        let sale = Sale {
            asset: trade.asset.clone(),
            quantity: trade.quantity,
            price: trade.price,
            at: now,
        };
        match tax::select_lots(&sale, &session.lots, &config.tax.method) {
            Ok(selection) => selections.push(selection),
            Err(e) => {
                warn!(asset = %trade.asset, error = %e, "Could not select lots for sell");
                tax_errors.push((trade.asset.clone(), e.to_string()));
                failed_selections += 1;
            }
        }
    }
    let tax = tax::summarize(&selections, &config.tax.rates, session.total_value);

    Ok(RebalanceReport {
        decision,
        plan,
        selections,
        tax_errors,
        failed_selections,
        tax,
    })
}

pub fn render_decision(decision: &GuardrailDecision) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![ui::header_cell("Asset"), ui::header_cell("Drift (pp)")]);
    for (asset, drift) in &decision.drifts {
        table.add_row(vec![
            Cell::new(asset),
            ui::right_cell(format!("{:+.2}", drift.round_dp(2))),
        ]);
    }

    let verdict = if decision.permit {
        ui::style_text("REBALANCE", ui::StyleType::TotalValue)
    } else {
        ui::style_text("WAIT", ui::StyleType::Warning)
    };
    let mut output = format!(
        "{}\n\n{}\n\n{} ({} mode): {}",
        ui::style_text("Guardrail", ui::StyleType::Title),
        table,
        verdict,
        decision.mode,
        decision.reason
    );
    if !decision.permit && !decision.estimated_savings.is_zero() {
        output.push_str(&format!(
            "\nEstimated savings from waiting: {}",
            ui::money(decision.estimated_savings)
        ));
    }
    if let Some(warning) = &decision.warning {
        output.push_str(&format!(
            "\n{}",
            ui::style_text(&format!("Warning: {warning}"), ui::StyleType::Warning)
        ));
    }
    if let Some(cap) = &decision.vol_cap {
        let suggested = cap
            .adjusted_basket
            .iter()
            .map(|(symbol, weight)| format!("{symbol} {weight}%"))
            .collect::<Vec<_>>()
            .join(", ");
        output.push_str(&format!(
            "\n{}\nSuggested basket: {}",
            ui::style_text(
                &format!(
                    "Volatility {}% exceeds cap {}%",
                    cap.portfolio_volatility, cap.threshold
                ),
                ui::StyleType::Warning
            ),
            suggested
        ));
    }
    output
}

pub fn render_plan(plan: &RebalancePlan) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Asset"),
        ui::header_cell("Side"),
        ui::header_cell("Quantity"),
        ui::header_cell("Price"),
        ui::header_cell("Notional"),
        ui::header_cell("Slippage"),
    ]);
    for trade in &plan.trades {
        let side_color = match trade.side {
            simulator::Side::Buy => Color::Green,
            simulator::Side::Sell => Color::Red,
        };
        let price = if trade.synthetic_price {
            format!("{}*", ui::price(trade.price))
        } else {
            ui::price(trade.price)
        };
        table.add_row(vec![
            Cell::new(&trade.asset),
            Cell::new(trade.side).fg(side_color),
            ui::right_cell(ui::quantity(trade.quantity)),
            ui::right_cell(price),
            ui::right_cell(ui::money(trade.notional)),
            ui::right_cell(ui::money(trade.slippage)),
        ]);
    }

    let mut output = format!(
        "{}\n\n{}\n\nTotal slippage: {}",
        ui::style_text("Trade Plan", ui::StyleType::Title),
        table,
        ui::style_text(&ui::money(plan.total_slippage), ui::StyleType::TotalValue)
    );
    if !plan.skipped.is_empty() {
        output.push_str(&format!(
            "\n{}",
            ui::style_text(
                &format!("Below minimum trade size: {}", plan.skipped.join(", ")),
                ui::StyleType::Subtle
            )
        ));
    }
    if !plan.synthetic_assets.is_empty() {
        output.push_str(&format!(
            "\n{}",
            ui::style_text(
                &format!("* synthetic price: {}", plan.synthetic_assets.join(", ")),
                ui::StyleType::Warning
            )
        ));
    }
    output
}

pub fn render_tax(report: &RebalanceReport) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Asset"),
        ui::header_cell("Lot"),
        ui::header_cell("Quantity"),
        ui::header_cell("Cost basis"),
        ui::header_cell("Realized"),
        ui::header_cell("Term"),
    ]);
    for selection in &report.selections {
        for entry in &selection.entries {
            table.add_row(vec![
                Cell::new(&selection.sale.asset),
                Cell::new(&entry.lot_id),
                ui::right_cell(ui::quantity(entry.quantity)),
                ui::right_cell(ui::price(entry.cost_basis)),
                ui::signed_money_cell(entry.realized),
                Cell::new(entry.term),
            ]);
        }
    }
    for (asset, error) in &report.tax_errors {
        table.add_row(vec![Cell::new(asset), Cell::new(error).fg(Color::Red)]);
    }

    let tax = &report.tax;
    let mut output = format!(
        "{}\n\n{}\n\nTax liability: {}  Harvestable losses: {}  After-tax value: {}",
        ui::style_text("Tax Impact", ui::StyleType::Title),
        table,
        ui::style_text(&ui::money(tax.liability), ui::StyleType::TotalValue),
        ui::money(tax.harvestable_losses),
        ui::money(tax.after_tax_value)
    );
    if report.failed_selections > 0 {
        output.push_str(&format!(
            "\n{}",
            ui::style_text(
                &format!(
                    "Failed lot selections: {} (excluded from the totals)",
                    report.failed_selections
                ),
                ui::StyleType::Warning
            )
        ));
    }
    output
}

pub async fn run(config: &AppConfig, service: &QuoteService) -> Result<()> {
    if let Some(warning) = config.portfolio.basket.validate() {
        warn!("{}", warning);
    }

    let assets = assets_to_quote(config);
    let spinner = ui::new_spinner("Fetching quotes");
    let quotes = service.get_quote_all(&assets).await;
    spinner.finish_and_clear();

    let report = build_report(config, &quotes, Utc::now())?;
    println!("{}", render_decision(&report.decision));
    ui::print_separator();
    println!("{}", render_plan(&report.plan));
    if !report.selections.is_empty() || !report.tax_errors.is_empty() {
        ui::print_separator();
        println!("{}", render_tax(&report));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn config() -> AppConfig {
        serde_yaml::from_str(
            r#"
portfolio:
  total_value: 2000
  basket:
    SOL: 50
    USDC: 50
  last_rebalance: "2024-06-01T00:00:00Z"
  lots:
    - id: "sol-old"
      asset: "SOL"
      acquired_at: "2023-01-01T00:00:00Z"
      quantity: 10
      cost_basis: 20
    - id: "sol-new"
      asset: "SOL"
      acquired_at: "2024-05-01T00:00:00Z"
      quantity: 5
      cost_basis: 150
    - id: "bonk-1"
      asset: "BONK"
      acquired_at: "2024-05-01T00:00:00Z"
      quantity: 1000
      cost_basis: 0.00003
"#,
        )
        .unwrap()
    }

    fn quotes() -> HashMap<String, Quote> {
        [("SOL", dec!(100)), ("USDC", dec!(1)), ("BONK", dec!(0.00002))]
            .iter()
            .map(|(s, p)| (s.to_string(), Quote::new(s, *p, "test")))
            .collect()
    }

    #[test]
    fn test_assets_to_quote_includes_held_assets() {
        let symbols: Vec<_> = assets_to_quote(&config())
            .into_iter()
            .map(|a| a.symbol)
            .collect();
        assert_eq!(symbols, vec!["SOL", "USDC", "BONK"]);
    }

    #[test]
    fn test_build_report_sells_with_fifo() {
        let now = "2024-06-10T00:00:00Z".parse().unwrap();
        let report = build_report(&config(), &quotes(), now).unwrap();

        // Everything held is SOL, so drift is far above threshold.
        assert!(report.decision.permit);

        let sol = report.plan.trades.iter().find(|t| t.asset == "SOL").unwrap();
        assert_eq!(sol.side, simulator::Side::Sell);
        assert_eq!(sol.quantity, dec!(5));

        assert_eq!(report.selections.len(), 1);
        let entry = &report.selections[0].entries[0];
        assert_eq!(entry.lot_id, "sol-old");
        assert_eq!(entry.realized, dec!(400));
        assert_eq!(report.tax.long_term_taxable, dec!(400));
        assert_eq!(report.tax.liability, dec!(60));

        let rendered = render_tax(&report);
        assert!(rendered.contains("sol-old"));
        assert_eq!(report.failed_selections, 0);
    }

    #[test]
    fn test_build_report_counts_failed_selections() {
        let mut config = config();
        config.tax.method = tax::LotMethod::SpecificId(vec!["missing".to_string()]);
        let now = "2024-06-10T00:00:00Z".parse().unwrap();
        let report = build_report(&config, &quotes(), now).unwrap();

        assert!(report.selections.is_empty());
        assert_eq!(report.failed_selections, 1);
        assert_eq!(report.tax_errors[0].0, "SOL");
        assert_eq!(report.tax.liability, Decimal::ZERO);
        assert!(render_tax(&report).contains("Failed lot selections: 1"));
    }

    #[test]
    fn test_build_report_uses_slippage_as_cost() {
        let mut config = config();
        config.guardrail.mode = guardrail::RebalanceMode::CostAware;
        let now = "2024-06-10T00:00:00Z".parse().unwrap();
        let report = build_report(&config, &quotes(), now).unwrap();

        assert_eq!(report.plan.total_slippage, dec!(1));
        assert!(report.decision.permit);
        assert!(report.decision.reason.starts_with("Cost justified"));
        assert!(render_decision(&report.decision).contains("cost-aware mode"));
    }
}
