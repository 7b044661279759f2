//! A flash sale: many concurrent checkouts compete for a few products.
//!
//! Run with `RUST_LOG=stockhold=debug` to watch lock acquisition and FIFO
//! allocation.

use std::sync::Arc;

use futures::future::join_all;
use stockhold::{NewLot, StockItem};
use stockhold_integration_tests::Harness;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let harness = Harness::new();
    let shirt = harness.catalog_product(20);
    let socks = harness.catalog_product(50);
    let mug = harness.catalog_product(5);

    let carts: Vec<Vec<StockItem>> = (0..40_u32)
        .map(|n| {
            let mut cart = vec![StockItem::new(socks, 1 + n % 2)];
            if n % 2 == 0 {
                cart.push(StockItem::new(shirt, 1));
            }
            if n % 5 == 0 {
                cart.push(StockItem::new(mug, 2));
            }
            cart
        })
        .collect();

    let checkouts = carts.into_iter().map(|cart| {
        let coordinator = Arc::clone(&harness.coordinator);
        tokio::spawn(async move { coordinator.reserve_items(&cart).await })
    });

    let mut reserved = 0;
    let mut rejected = 0;
    for outcome in join_all(checkouts).await {
        if outcome??.is_reserved() {
            reserved += 1;
        } else {
            rejected += 1;
        }
    }
    println!("\n=== Checkouts: {reserved} reserved, {rejected} rejected ===");

    // A late delivery of mugs, sold after whatever is left of the first lot
    let _lot = harness
        .coordinator
        .add_lot(mug, NewLot::with_quantity(3))
        .await?;

    for (name, product) in [("shirt", shirt), ("socks", socks), ("mug", mug)] {
        let level = harness.coordinator.stock_level(product).await?;
        println!(
            "  {name}: available {}, reserved {}, lots {}",
            level.available, level.reserved, level.lots
        );
    }

    Ok(())
}
