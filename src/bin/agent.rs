use clap::Parser;
use metrics_alerting::{agent::Agent, config::AgentConfig, logging, shutdown::shutdown_signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cfg = AgentConfig::parse();
    let agent = Agent::new(&cfg);
    agent.run_until(shutdown_signal()).await;
    Ok(())
}
