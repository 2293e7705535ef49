use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use handoff::Inherited;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;

const FALLBACK_ADDR: &str = "0.0.0.0:6188";

struct Greeter {
    uuid: uuid::Uuid,
    generation: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // the environment is consumed before any runtime thread exists
    let inherited = Inherited::from_env()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(inherited))
}

async fn run(mut inherited: Option<Inherited>) -> Result<(), Box<dyn std::error::Error>> {
    let generation = inherited.as_ref().map(|i| i.generation).unwrap_or(0);
    let std_listeners = match inherited.as_mut() {
        Some(inherited) => inherited.take_listeners(),
        None => {
            // Not supervised; bind our own socket
            let addr: SocketAddr = FALLBACK_ADDR.parse()?;
            vec![std::net::TcpListener::bind(addr)?]
        }
    };

    let greeter = Arc::new(Greeter {
        uuid: uuid::Uuid::new_v4(),
        generation,
    });
    let app = app(greeter.clone());

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut servers = JoinSet::new();
    for listener in std_listeners {
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        info!(
            "instance {} generation {} serving {}",
            greeter.uuid,
            generation,
            listener.local_addr()?
        );
        servers.spawn(serve(listener, app.clone(), stop_rx.clone()));
    }

    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut hangup = signal(SignalKind::hangup())?;

    if let Some(inherited) = inherited.as_mut() {
        inherited.ready()?;
    }

    loop {
        tokio::select! {
            _ = hangup.recv() => info!("SIGHUP received, nothing to reload"),
            _ = terminate.recv() => break,
            _ = quit.recv() => break,
        }
    }

    info!("draining generation {}", generation);
    let _ = stop_tx.send(true);
    while let Some(result) = servers.join_next().await {
        match result {
            Ok(Err(e)) => warn!("server failed: {}", e),
            Err(e) => warn!("server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    info!("generation {} drained", generation);
    Ok(())
}

fn app(greeter: Arc<Greeter>) -> Router {
    Router::new().route("/", get(hello)).with_state(greeter)
}

/// Serves until `stop` flips, then stops accepting and waits for in-flight requests.
async fn serve(
    listener: TcpListener,
    app: Router,
    mut stop: watch::Receiver<bool>,
) -> io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await
}

async fn hello(State(greeter): State<Arc<Greeter>>) -> String {
    format!(
        "Hello, world! (instance: {}, generation: {})",
        greeter.uuid, greeter.generation
    )
}
