//! `fudd`: the UDP mailbox-status lookup daemon. Runs with a trivial
//! [`silo_discovery::LocationResolver`] (every mailbox answers as
//! local) unless a proxy configuration is present, in which case
//! lookups are resolved against the same mailbox-to-backend map
//! `proxyd`'s murder layer maintains.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use silo_discovery::{FudServer, LocalOnly, LocationResolver};
use silo_proxy::BackendMap;
use silo_store::SpoolPaths;

#[derive(Args, Debug)]
pub struct FuddArgs {
    #[clap(short = 'C', long)]
    config: Option<PathBuf>,
}

pub async fn run(args: FuddArgs) -> Result<()> {
    let config = match args.config {
        Some(path) => silo_config::read_config(path)?,
        None => silo_config::load_from_environment()?,
    };

    let discovery = config
        .discovery
        .clone()
        .context("[discovery] section missing from configuration")?;

    let paths = SpoolPaths::new(&config.spool.root);
    let namespace = config.namespace.namespace();

    let locations: Arc<dyn LocationResolver> = match &config.proxy {
        Some(_) => {
            let backend_map_path = paths.db_dir().join("backend_map.db");
            let map = BackendMap::open(&backend_map_path, config.lmtp.hostname.clone())
                .context("opening backend-to-mailbox map")?;
            Arc::new(map)
        }
        None => Arc::new(LocalOnly),
    };

    let server = FudServer::bind(discovery.bind_addr, paths, namespace, locations)
        .await
        .context("binding fud socket")?;

    let must_exit = crate::signals::install("fudd");
    server.run(must_exit).await.context("fud server exited with an error")?;
    Ok(())
}
