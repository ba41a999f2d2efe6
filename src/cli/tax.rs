use super::ui;
use crate::core::config::AppConfig;
use crate::core::tax::{self, LotMethod, Sale, TaxLotSelection, TaxRates, Term};
use crate::providers::QuoteService;
use anyhow::{Context, Result};
use chrono::Utc;
use comfy_table::Cell;
use rust_decimal::Decimal;

pub fn render_selection(selection: &TaxLotSelection) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Lot"),
        ui::header_cell("Quantity"),
        ui::header_cell("Cost basis"),
        ui::header_cell("Held (days)"),
        ui::header_cell("Term"),
        ui::header_cell("Realized"),
    ]);
    for entry in &selection.entries {
        table.add_row(vec![
            Cell::new(&entry.lot_id),
            ui::right_cell(ui::quantity(entry.quantity)),
            ui::right_cell(ui::price(entry.cost_basis)),
            ui::right_cell(entry.holding_days),
            Cell::new(entry.term),
            ui::signed_money_cell(entry.realized),
        ]);
    }
    format!(
        "{} {} {} at {} ({})\n\n{}",
        ui::style_text("Sell", ui::StyleType::Title),
        ui::quantity(selection.sale.quantity),
        selection.sale.asset,
        ui::price(selection.sale.price),
        selection.method,
        table
    )
}

pub fn render_comparison(selections: &[TaxLotSelection], rates: &TaxRates) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Method"),
        ui::header_cell("Short-term"),
        ui::header_cell("Long-term"),
        ui::header_cell("Realized"),
        ui::header_cell("Est. tax"),
    ]);
    for selection in selections {
        let summary = tax::summarize(std::slice::from_ref(selection), rates, Decimal::ZERO);
        table.add_row(vec![
            Cell::new(&selection.method),
            ui::signed_money_cell(selection.realized_for(Term::ShortTerm)),
            ui::signed_money_cell(selection.realized_for(Term::LongTerm)),
            ui::signed_money_cell(selection.realized()),
            ui::right_cell(ui::money(summary.liability)),
        ]);
    }
    format!(
        "{}\n\n{}",
        ui::style_text("Method Comparison", ui::StyleType::Title),
        table
    )
}

pub async fn run(
    config: &AppConfig,
    service: &QuoteService,
    asset: &str,
    quantity: Decimal,
    method: Option<LotMethod>,
) -> Result<()> {
    let reference = config
        .asset(asset)
        .cloned()
        .unwrap_or_else(|| crate::core::price::Asset::new(asset));
    let quote = service.get_quote(&reference).await;
    if quote.synthetic {
        println!(
            "{}",
            ui::style_text(
                &format!("Using synthetic price for {asset}"),
                ui::StyleType::Warning
            )
        );
    }

    let sale = Sale {
        asset: asset.to_string(),
        quantity,
        price: quote.price,
        at: Utc::now(),
    };
    let lots = &config.portfolio.lots;
    let method = method.unwrap_or_else(|| config.tax.method.clone());

    let selection = tax::select_lots(&sale, lots, &method)
        .with_context(|| format!("Failed to select lots for {asset}"))?;
    println!("{}", render_selection(&selection));

    let summary = tax::summarize(
        std::slice::from_ref(&selection),
        &config.tax.rates,
        config.portfolio.total_value,
    );
    println!(
        "\nProceeds: {}  Tax: {}  Harvestable losses: {}  After-tax value: {}",
        ui::money(selection.proceeds()),
        ui::style_text(&ui::money(summary.liability), ui::StyleType::TotalValue),
        ui::money(summary.harvestable_losses),
        ui::money(summary.after_tax_value)
    );

    ui::print_separator();
    let comparison = tax::compare_methods(&sale, lots)?;
    println!("{}", render_comparison(&comparison, &config.tax.rates));
    Ok(())
}
