use anyhow::Result;

mod bootstrap;
mod config_loader;
mod control_api;
mod feed_runtime;

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::async_main().await
}
