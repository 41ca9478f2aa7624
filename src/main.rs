use std::env;
use std::io;
use std::path::Path;

use anyhow::Context;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crm_core::App;
use crm_core::batch::Batch;
use crm_core::config::Config;
use crm_core::csv::{read_commands, read_products, write_wallets};

const USAGE: &str = "usage: crm-core <products.csv> <commands.csv>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .with_writer(io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let products_path = args.next().context(USAGE)?;
    let commands_path = args.next().context(USAGE)?;

    for path in [&products_path, &commands_path] {
        if !path.ends_with(".csv") {
            warn!(path, "input file seems to not be a csv file");
        }
    }

    let config = Config::load(None).context("failed to load configuration")?;
    let app = App::new(&config).await.context("failed to open the store")?;

    let products = read_products(&products_path)?;
    info!(count = products.len(), "catalog loaded");
    for product in &products {
        app.store.upsert_product(product).await?;
    }

    let commands = read_commands(Path::new(&commands_path))?;
    let (sender, receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in commands {
            match result {
                Ok(command) => {
                    if sender.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    let summary = Batch::new(app.clone())
        .run(ReceiverStream::new(receiver))
        .await;
    info!(applied = summary.applied, skipped = summary.skipped, "batch finished");

    write_wallets(io::stdout().lock(), app.store.wallets().await?)?;
    Ok(())
}
