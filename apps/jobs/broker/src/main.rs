//! Job broker - Entry Point
//!
//! Declares the configured pipelines and dispatches their jobs until SIGINT
//! or SIGTERM.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    jobs_broker::run().await
}
