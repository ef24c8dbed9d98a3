use std::sync::Arc;

use clap::Parser;
use poly_scalper::cli::{Cli, Commands};
use poly_scalper::config::Config;
use poly_scalper::engine::Engine;
use poly_scalper::events::EventBus;
use poly_scalper::execution::{RestVenue, VenueExecutor};
use poly_scalper::feed::{BinanceFeed, CoinbaseFeed, PriceFeed};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;

    poly_scalper::telemetry::init_telemetry(&config.telemetry)?;

    match cli.command {
        Commands::Run(args) => {
            if args.dry_run {
                config.engine.trading_enabled = false;
            }
            run(config).await?;
        }
        Commands::Status => {
            println!("poly-scalper status");
            println!("  Status: not running (start with `poly-scalper run`)");
        }
        Commands::Config => {
            println!("Current configuration:");
            println!("  Trading enabled: {}", config.engine.trading_enabled);
            println!(
                "  Markets: max {} concurrent, daily loss limit {}",
                config.engine.max_concurrent_markets, config.engine.daily_loss_limit
            );
            println!(
                "  Strategy: entry {} / DCA {} {} / unwind {} / TP {}",
                config.strategy.entry_trigger,
                config.strategy.dca_drop_1,
                config.strategy.dca_drop_2,
                config.strategy.unwind_trigger,
                config.strategy.tp_price
            );
            println!("  Spot feed: {}", config.feed.symbol);
            println!("  Venue: {}", config.venue.rest_url);
        }
    }

    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let venue: Arc<dyn VenueExecutor> = Arc::new(RestVenue::new(&config.venue)?);
    let feeds: Vec<Arc<dyn PriceFeed>> = vec![
        Arc::new(BinanceFeed::new(&config.feed.symbol)),
        Arc::new(CoinbaseFeed::for_symbol(&config.feed.symbol)),
    ];
    let bus = EventBus::default();

    let engine = Engine::new(config, venue, feeds, bus.clone());

    // Console observer for the event stream
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        tracing::info!(event = %json, "engine event");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event observer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    engine.start().await?;
    tracing::info!("engine running; markets are added via the control surface");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    engine.stop().await;

    Ok(())
}
