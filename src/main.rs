use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use clap::Parser;
use shard_seckill::{
    ledger::recover, Directory, Dispatcher, Error, Request, Smp, SmpConfig,
};
use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "seckill-server", version, about = "Flash-sale order server")]
struct Cli {
    /// HTTP server port
    #[arg(long, default_value_t = 10000)]
    port: u16,
    /// Number of shards (defaults to the number of logical CPUs)
    #[arg(long)]
    shards: Option<usize>,
    /// Shard that owns the ledger (defaults to the last one)
    #[arg(long)]
    writer_shard: Option<usize>,
    /// Seed snapshot with the initial accounts and inventory
    #[arg(long, default_value = "input.txt")]
    input: PathBuf,
    /// Order write-ahead log
    #[arg(long, default_value = "log.txt")]
    log: PathBuf,
    /// Pin shard i to core i
    #[arg(long, default_value_t = false)]
    pin_shards: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = SmpConfig::new().with_cpu_affinity(cli.pin_shards);
    if let Some(shards) = cli.shards {
        config = config.with_num_shards(shards);
    }
    let smp = Smp::new(config).context("starting shards")?;
    let writer = cli.writer_shard.unwrap_or_else(|| smp.last_shard());

    let mut ledger = Directory::new(&smp);
    let (input, log) = (cli.input.clone(), cli.log.clone());
    ledger
        .start_single(writer, move |_| recover(&input, &log))
        .with_context(|| {
            format!(
                "recovering ledger from {} and {}",
                cli.input.display(),
                cli.log.display()
            )
        })?;
    let ledger = Arc::new(ledger);

    let app = Router::new()
        .route("/seckill/:route", get(handle))
        .with_state(Dispatcher::new(Arc::clone(&ledger), writer));

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, shards = smp.count(), writer, "seckill server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    info!("shutting down");
    match Arc::try_unwrap(ledger) {
        Ok(mut ledger) => tokio::task::spawn_blocking(move || ledger.stop())
            .await
            .context("joining ledger stop")?
            .context("stopping ledger")?,
        Err(_) => warn!("ledger still referenced at shutdown"),
    }
    smp.shutdown();
    Ok(())
}

async fn handle(
    State(dispatcher): State<Dispatcher>,
    Path(route): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !Request::ROUTES.contains(&route.as_str()) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let reply = match Request::from_route(&route, &params) {
        Ok(request) => dispatcher.dispatch(request).recv().await,
        Err(e) => Err(e),
    };

    match reply.and_then(|reply| reply.render()) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e @ Error::BadRequest(_)) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        Err(e) => {
            error!(route, "request failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {}", e);
    }
}
