use handoff::{Config, Routes, SignalRouter, Supervisor};
use log::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Optional path to a JSON config
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    runtime.block_on(supervise(config))
}

async fn supervise(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let routes = Routes::from_config(&config);
    let (supervisor, handle) = Supervisor::new(config)?;

    info!("Starting supervisor...");
    let router = SignalRouter::spawn(routes, handle)?;
    let result = supervisor.run().await;
    router.close();

    if let Err(e) = &result {
        error!("supervisor failed: {}", e);
    }
    Ok(result?)
}
