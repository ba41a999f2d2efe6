use super::ui;
use crate::core::config::AppConfig;
use crate::core::tax::{self, HarvestCandidate, Lot, LotStatus};
use crate::providers::QuoteService;
use anyhow::Result;
use chrono::Utc;
use comfy_table::Cell;
use std::collections::{BTreeSet, HashMap};

/// Status for every asset appearing in the lot history, sorted by symbol.
pub fn statuses(lots: &[Lot]) -> Vec<LotStatus> {
    let assets: BTreeSet<&str> = lots.iter().map(|l| l.asset.as_str()).collect();
    assets
        .into_iter()
        .map(|asset| tax::lot_status(asset, lots))
        .collect()
}

pub fn render_status(statuses: &[LotStatus]) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Asset"),
        ui::header_cell("Open quantity"),
        ui::header_cell("Cost basis"),
        ui::header_cell("Avg cost"),
        ui::header_cell("Open lots"),
        ui::header_cell("Retired"),
        ui::header_cell("Oldest"),
    ]);
    for status in statuses {
        table.add_row(vec![
            Cell::new(&status.asset),
            ui::right_cell(ui::quantity(status.open_quantity)),
            ui::right_cell(ui::money(status.total_cost_basis)),
            ui::format_optional_cell(status.average_cost, ui::price),
            ui::right_cell(status.open_lots),
            ui::right_cell(status.retired_lots),
            ui::format_optional_cell(status.oldest, |d| d.format("%Y-%m-%d").to_string()),
        ]);
    }
    format!(
        "{}\n\n{}",
        ui::style_text("Lot Status", ui::StyleType::Title),
        table
    )
}

pub fn render_harvest(candidates: &[HarvestCandidate]) -> String {
    let title = ui::style_text("Tax-Loss Harvesting", ui::StyleType::Title);
    if candidates.is_empty() {
        return format!(
            "{}\n\n{}",
            title,
            ui::style_text("No lots with unrealized losses", ui::StyleType::Subtle)
        );
    }

    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Lot"),
        ui::header_cell("Asset"),
        ui::header_cell("Quantity"),
        ui::header_cell("Cost basis"),
        ui::header_cell("Price"),
        ui::header_cell("Unrealized loss"),
        ui::header_cell("Term"),
    ]);
    for candidate in candidates {
        table.add_row(vec![
            Cell::new(&candidate.lot_id),
            Cell::new(&candidate.asset),
            ui::right_cell(ui::quantity(candidate.quantity)),
            ui::right_cell(ui::price(candidate.cost_basis)),
            ui::right_cell(ui::price(candidate.price)),
            ui::signed_money_cell(-candidate.unrealized_loss),
            Cell::new(candidate.term),
        ]);
    }
    let total: rust_decimal::Decimal = candidates.iter().map(|c| c.unrealized_loss).sum();
    format!(
        "{}\n\n{}\n\nHarvestable: {}",
        title,
        table,
        ui::style_text(&ui::money(total), ui::StyleType::TotalValue)
    )
}

pub async fn run(config: &AppConfig, service: &QuoteService) -> Result<()> {
    let lots = &config.portfolio.lots;
    println!("{}", render_status(&statuses(lots)));

    let assets = super::rebalance::assets_to_quote(config);
    let spinner = ui::new_spinner("Fetching quotes");
    let quotes = service.get_quote_all(&assets).await;
    spinner.finish_and_clear();

    let prices: HashMap<String, _> = quotes
        .into_iter()
        .map(|(symbol, quote)| (symbol, quote.price))
        .collect();
    ui::print_separator();
    println!(
        "{}",
        render_harvest(&tax::harvest_candidates(lots, &prices, Utc::now()))
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn lot(id: &str, asset: &str, quantity: rust_decimal::Decimal) -> Lot {
        Lot {
            id: id.to_string(),
            asset: asset.to_string(),
            acquired_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            quantity,
            cost_basis: dec!(2),
        }
    }

    #[test]
    fn test_statuses_per_asset() {
        let lots = vec![
            lot("a", "SOL", dec!(1)),
            lot("b", "BONK", dec!(10)),
            lot("c", "SOL", dec!(0)),
        ];
        let statuses = statuses(&lots);
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].asset, "BONK");
        assert_eq!(statuses[1].open_lots, 1);
        assert_eq!(statuses[1].retired_lots, 1);
        assert!(render_status(&statuses).contains("SOL"));
    }

    #[test]
    fn test_render_harvest_empty() {
        assert!(render_harvest(&[]).contains("No lots with unrealized losses"));
    }
}
