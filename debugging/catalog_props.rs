//! Fetch one title from the upstream catalog and print how it is normalized.
//! Usage:
//!   cargo run --bin catalog_props -- view <id>
//!   cargo run --bin catalog_props -- list <sort> [type] [tag]
//!   cargo run --bin catalog_props -- palette <image_url>
//! Reads VOKINO_TOKEN / VOKINO_BASE_URL from the environment (.env supported).

use anyhow::{Context, Result};
use cinerails::catalog::{CatalogApi, ListQuery, VokinoClient};
use cinerails::config::Config;
use cinerails::models::{list_items, TitleRecord};
use cinerails::palette;
use dotenvy::dotenv;
use serde_json::{json, Value};
use std::env;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: cargo run --bin catalog_props -- view <id>");
        eprintln!("       cargo run --bin catalog_props -- list <sort> [type] [tag]");
        eprintln!("       cargo run --bin catalog_props -- palette <image_url>");
        std::process::exit(1);
    }

    let config = Config::from_env()?;
    let client = VokinoClient::from_config(&config)?;

    match args[1].as_str() {
        "view" => print_view(&client, &args[2]).await?,
        "list" => {
            let query = ListQuery::new(
                Some(args[2].as_str()),
                args.get(3).map(String::as_str),
                args.get(4).map(String::as_str),
            );
            print_list(&client, &query).await?
        }
        "palette" => {
            let palette = palette::extract_from_url(client.fetcher(), &args[2]).await;
            println!("{}", serde_json::to_string_pretty(&palette)?);
        }
        other => anyhow::bail!("unknown command '{}'", other),
    }

    Ok(())
}

async fn print_view(client: &VokinoClient, id: &str) -> Result<()> {
    let cancel = CancellationToken::new();
    let raw = client
        .view(id, &cancel)
        .await
        .with_context(|| format!("view {} failed", id))?;
    let timeline = client.timeline(id, &cancel).await.ok().flatten();

    println!("Raw keys: {}", keys(&raw).join(", "));
    if let Some(details) = raw.get("details") {
        println!("details keys: {}", keys(details).join(", "));
    }
    println!("Kinopoisk id (timeline): {}", timeline.as_deref().unwrap_or("-"));

    match TitleRecord::from_value(&raw) {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("Could not normalize title {}", id),
    }
    Ok(())
}

async fn print_list(client: &VokinoClient, query: &ListQuery) -> Result<()> {
    let body = client
        .list(&query.with_page(1))
        .await
        .with_context(|| format!("list {} failed", query.path()))?;
    let items = list_items(&body);
    println!("{} items on page 1 of {}", items.len(), query.path());
    for item in items {
        let summary = match TitleRecord::from_value(item) {
            Some(t) => json!({
                "id": t.id,
                "name": t.name,
                "year": t.year,
                "rating_kp": t.rating_kp,
                "poster": t.poster.is_some(),
                "backdrop": t.backdrop.is_some(),
            }),
            None => json!({ "unparsed_keys": keys(item) }),
        };
        println!("{}", summary);
    }
    Ok(())
}

fn keys(value: &Value) -> Vec<String> {
    value
        .as_object()
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default()
}
