// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

use anyhow::Result as AnyhowResult;
use clap::Parser;

use noctua_engine::cli::{run, Cli};

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    run(Cli::parse()).await
}
