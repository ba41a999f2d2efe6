use super::ui;
use crate::core::cache::CacheHealth;
use crate::core::config::AppConfig;
use crate::core::price::{Asset, Quote};
use crate::providers::{QuoteService, SourceHealth};
use anyhow::{Context, Result};
use comfy_table::{Cell, Color};
use serde::Serialize;
use std::collections::HashMap;

pub fn render_quotes(assets: &[Asset], quotes: &HashMap<String, Quote>) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Asset"),
        ui::header_cell("Price"),
        ui::header_cell("Source"),
        ui::header_cell("As of"),
    ]);

    for asset in assets {
        let Some(quote) = quotes.get(&asset.symbol) else {
            continue;
        };
        let source = if quote.synthetic {
            Cell::new(format!("{} (synthetic)", quote.source)).fg(Color::Yellow)
        } else {
            Cell::new(&quote.source)
        };
        table.add_row(vec![
            Cell::new(&asset.symbol),
            ui::right_cell(ui::price(quote.price)),
            source,
            Cell::new(quote.timestamp.format("%H:%M:%S").to_string()),
        ]);
    }

    format!(
        "{}\n\n{}",
        ui::style_text("Live Quotes", ui::StyleType::Title),
        table
    )
}

pub fn render_cache_health(health: &CacheHealth, synthetic_fallbacks: u64) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Hits"),
        ui::header_cell("Misses"),
        ui::header_cell("Hit rate"),
        ui::header_cell("Evictions"),
        ui::header_cell("Size"),
        ui::header_cell("Freshness"),
        ui::header_cell("Synthetic"),
    ]);
    table.add_row(vec![
        ui::right_cell(health.hits),
        ui::right_cell(health.misses),
        ui::right_cell(format!("{:.1}%", health.hit_rate())),
        ui::right_cell(health.evictions),
        ui::right_cell(format!("{}/{}", health.size, health.capacity)),
        ui::right_cell(format!("{}s", health.freshness_window.as_secs())),
        ui::right_cell(synthetic_fallbacks),
    ]);

    format!(
        "{}\n\n{}",
        ui::style_text("Cache Health", ui::StyleType::Title),
        table
    )
}

pub fn render_source_health(health: &SourceHealth) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Provider"),
        ui::header_cell("Last outcome"),
        ui::header_cell("Latency"),
        ui::header_cell("Avg"),
        ui::header_cell("p50"),
        ui::header_cell("p95"),
        ui::header_cell("Error rate"),
        ui::header_cell("Successes"),
        ui::header_cell("Failures"),
    ]);
    let millis = |latency: std::time::Duration| format!("{} ms", latency.as_millis());

    for provider in &health.providers {
        let outcome = match &provider.last_outcome {
            Some(outcome) if outcome.is_success() => Cell::new(outcome).fg(Color::Green),
            Some(outcome) => Cell::new(outcome).fg(Color::Red),
            None => Cell::new("not tried").fg(Color::DarkGrey),
        };
        table.add_row(vec![
            Cell::new(&provider.provider),
            outcome,
            ui::format_optional_cell(provider.last_latency, millis),
            ui::format_optional_cell(provider.avg_latency, millis),
            ui::format_optional_cell(provider.p50_latency, millis),
            ui::format_optional_cell(provider.p95_latency, millis),
            ui::right_cell(format!("{}%", provider.error_rate)),
            ui::right_cell(provider.successes),
            ui::right_cell(provider.failures),
        ]);
    }

    format!(
        "{}\n\n{}",
        ui::style_text("Source Health", ui::StyleType::Title),
        table
    )
}

#[derive(Serialize)]
struct QuotesReport<'a> {
    quotes: Vec<&'a Quote>,
    cache: CacheHealth,
    synthetic_fallbacks: u64,
    sources: SourceHealth,
}

pub async fn run(config: &AppConfig, service: &QuoteService, json: bool) -> Result<()> {
    let assets = config.assets.clone();
    let spinner = ui::new_spinner("Fetching quotes");
    let quotes = service.get_quote_all(&assets).await;
    spinner.finish_and_clear();

    if json {
        let report = QuotesReport {
            quotes: assets
                .iter()
                .filter_map(|a| quotes.get(&a.symbol))
                .collect(),
            cache: service.cache_health(),
            synthetic_fallbacks: service.synthetic_fallbacks(),
            sources: service.source_health().await,
        };
        let output =
            serde_json::to_string_pretty(&report).context("Failed to serialize quotes report")?;
        println!("{output}");
        return Ok(());
    }

    println!("{}", render_quotes(&assets, &quotes));
    ui::print_separator();
    println!(
        "{}",
        render_cache_health(&service.cache_health(), service.synthetic_fallbacks())
    );
    ui::print_separator();
    println!("{}", render_source_health(&service.source_health().await));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::price::AttemptOutcome;
    use crate::providers::chain::ProviderHealth;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    #[test]
    fn test_render_quotes_flags_synthetic() {
        let assets = vec![Asset::new("SOL"), Asset::new("BONK")];
        let quotes = HashMap::from([
            ("SOL".to_string(), Quote::new("SOL", dec!(182.5), "jupiter")),
            (
                "BONK".to_string(),
                Quote {
                    synthetic: true,
                    ..Quote::new("BONK", dec!(0.000025), "synthetic")
                },
            ),
        ]);

        let output = render_quotes(&assets, &quotes);
        assert!(output.contains("$182.50"));
        assert!(output.contains("synthetic (synthetic)"));
        assert!(output.contains("$0.000025"));
    }

    #[test]
    fn test_render_source_health() {
        let health = SourceHealth {
            providers: vec![ProviderHealth {
                last_outcome: Some(AttemptOutcome::HttpStatus(503)),
                last_latency: Some(Duration::from_millis(42)),
                successes: 2,
                failures: 1,
                recent_calls: 3,
                avg_latency: Some(Duration::from_millis(30)),
                p50_latency: Some(Duration::from_millis(25)),
                p95_latency: Some(Duration::from_millis(57)),
                error_rate: dec!(33.33),
                ..ProviderHealth::new("kraken")
            }],
            recent_attempts: vec![],
        };
        let output = render_source_health(&health);
        assert!(output.contains("kraken"));
        assert!(output.contains("http 503"));
        assert!(output.contains("42 ms"));
        assert!(output.contains("57 ms"));
        assert!(output.contains("33.33%"));
    }
}
