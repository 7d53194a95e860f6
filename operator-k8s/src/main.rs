//! mysql-operator binary
use anyhow::Result;
use clap::Parser;
use mysql_operator::config::Config;
use mysql_operator::operator::Operator;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let config = Config::parse();
    Operator::new(config).run().await
}
