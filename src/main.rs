//! Pages gateway server
//!
//! Entry point: loads the YAML configuration, sets up logging, wires the
//! configured backend into a [`PageServer`] and runs the accept loop until
//! interrupted.

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use pages_gateway::blob_cache::MemoryBlobCache;
use pages_gateway::filter::Params;
use pages_gateway::gitea::GiteaBackend;
use pages_gateway::kv::MemoryKv;
use pages_gateway::local::LocalBackend;
use pages_gateway::{Backend, PageServer, PageServerOptions, ServerConfig};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config_path = env::args().nth(1).unwrap_or_else(|| "pages.yaml".to_string());
    info!("loading configuration from {}", config_path);
    let config = match ServerConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let backend: Arc<dyn Backend> = if let Some(gitea) = &config.backend.gitea {
        match GiteaBackend::new(&gitea.server, &gitea.token, &config.backend.branch) {
            Ok(backend) => {
                info!("serving from gitea at {}", gitea.server);
                Arc::new(backend)
            }
            Err(e) => {
                error!("failed to set up gitea backend: {}", e);
                std::process::exit(1);
            }
        }
    } else if let Some(local) = &config.backend.local {
        info!("serving from local tree at {}", local.root);
        Arc::new(LocalBackend::new(&local.root, &config.backend.branch))
    } else {
        error!("no backend configured");
        std::process::exit(1);
    };

    let kv: Arc<dyn pages_gateway::kv::Kv> = match &config.cache.snapshot {
        Some(path) => match MemoryKv::with_snapshot(path) {
            Ok(kv) => Arc::new(kv),
            Err(e) => {
                error!("failed to open kv snapshot: {}", e);
                std::process::exit(1);
            }
        },
        None => Arc::new(MemoryKv::new()),
    };
    let blob_cache = Arc::new(MemoryBlobCache::new(config.cache.blob_capacity));

    let mut filter_globals = HashMap::new();
    for (kind, value) in &config.filters {
        filter_globals.insert(kind.clone(), Params::from_json(value.clone()));
    }

    let options = PageServerOptions {
        scheme: config.scheme.clone(),
        meta_ttl: config.meta_ttl(),
        blob_ttl: config.blob_ttl(),
        blob_limit: config.cache.blob_limit,
        backend_concurrency: config.limits.backend_concurrency,
        cache_concurrency: config.limits.cache_concurrency,
        refresh_concurrency: config.limits.refresh_concurrency,
        script_timeout: config.script_timeout(),
        filter_globals,
        ..PageServerOptions::new(&config.base_domain, kv, blob_cache)
    };
    let server = match PageServer::new(backend, options) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to build server: {}", e);
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&config.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {}", config.bind, e);
            std::process::exit(1);
        }
    };
    info!("pages gateway listening on http://{}", config.bind);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("accept failed: {}", e);
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let server = server.clone();
                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        let server = server.clone();
                        async move { server.serve_hyper(req, remote).await }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        tracing::debug!("connection error: {:?}", e);
                    }
                });
            }
        }
    }

    server.close().await;
}
