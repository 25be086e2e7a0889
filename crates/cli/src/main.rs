//! The main entrypoint for bootslot, which just performs global initialization
//! and then calls out into the library.

use anyhow::Result;
use owo_colors::OwoColorize;

async fn run() -> Result<()> {
    bootslot_utils::initialize_tracing();
    tracing::trace!("starting");
    bootslot_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}{:#}", "error: ".red(), e);
        std::process::exit(1);
    }
}
