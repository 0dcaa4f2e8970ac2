//! `lmtpd`: the long-running LMTP front end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use silo_delivery::{LmtpServer, NoSieve, Sendmail};
use silo_duplicate::DuplicateTable;
use silo_store::{MailboxList, SpoolPaths};

#[derive(Args, Debug)]
pub struct LmtpdArgs {
    #[clap(short = 'C', long)]
    config: Option<PathBuf>,
}

pub async fn run(args: LmtpdArgs) -> Result<()> {
    let config = match args.config {
        Some(path) => silo_config::read_config(path)?,
        None => silo_config::load_from_environment()?,
    };

    let paths = SpoolPaths::new(&config.spool.root);
    let namespace = config.namespace.namespace();

    let list = MailboxList::open(paths.mailbox_list_path()).context("opening mailbox list")?;

    let dup_path = paths.db_dir().join("duplicate.db");
    let duplicates = DuplicateTable::open(&dup_path).context("opening duplicate suppression table")?;

    let must_exit = crate::signals::install("lmtpd");

    let server = LmtpServer::new(
        config.lmtp.bind_addr,
        config.lmtp.hostname.clone(),
        paths,
        namespace,
        list,
        duplicates,
        Arc::new(NoSieve),
        Arc::new(Sendmail::default()),
    );

    server.run(must_exit).await.context("LMTP server exited with an error")?;
    Ok(())
}
