use clap::Parser;
use dualstratum_proxy::backend::BackendClient;
use dualstratum_proxy::cli::Cli;
use dualstratum_proxy::job::Algo;
use dualstratum_proxy::rpc::NodeRpc;
use dualstratum_proxy::server::Acceptor;
use std::net::SocketAddr;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let max_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let node_url = url::Url::parse(&cli.node)
        .map_err(|e| anyhow::anyhow!("invalid node URL {:?}: {e}", cli.node))?;

    let log_jobs = cli.jobs || cli.verbose;
    let progpow_rpc = NodeRpc::new(node_url.clone())?;
    let randomx_rpc = NodeRpc::new(node_url)?;
    let progpow = BackendClient::new(Algo::Progpow, progpow_rpc, log_jobs);
    let randomx = BackendClient::new(Algo::RandomX, randomx_rpc, log_jobs);

    let addr: SocketAddr = format!("{}:{}", cli.address, cli.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address {}:{}: {e}", cli.address, cli.port))?;

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    tasks.spawn({
        let progpow = progpow.clone();
        let cancel = cancel.clone();
        async move { progpow.run(cancel).await }
    });
    tasks.spawn({
        let randomx = randomx.clone();
        let cancel = cancel.clone();
        async move { randomx.run(cancel).await }
    });

    let acceptor = Acceptor::new(addr, progpow, randomx);
    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = acceptor.run(cancel).await {
                tracing::error!(error = %e, "acceptor exited with error");
            }
        }
    });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping");
    cancel.cancel();

    while tasks.join_next().await.is_some() {}
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            _ = ctrl_c => tracing::info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to register Ctrl+C handler");
        tracing::info!("received Ctrl+C");
    }
}
