//! The one-shot `deliver` subcommand: reads a message from stdin and
//! hands it to [`silo_delivery::run_deliver`], the same dispatch path
//! `lmtpd` uses per RCPT TO. A local MTA invokes this directly instead
//! of speaking LMTP when it's running on the same host as the spool.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use silo_delivery::{run_deliver, DeliverRequest, NoSieve, Sendmail};
use silo_duplicate::{now_unix, DuplicateTable};
use silo_store::SpoolPaths;

#[derive(Args, Debug)]
pub struct DeliverArgs {
    /// Local recipient, one per occurrence. At least one is required.
    #[clap(short = 'r', long = "recipient", required = true)]
    recipients: Vec<String>,

    /// Envelope sender, recorded on the delivered copy.
    #[clap(short = 'f', long)]
    from: Option<String>,

    /// Bypass quota enforcement for this delivery (administrative
    /// bounce or resend).
    #[clap(short = 'q', long)]
    ignore_quota: bool,

    /// Check and record this delivery's `Message-Id` in the
    /// duplicate-suppression table.
    #[clap(short = 'e', long)]
    suppress_duplicates: bool,

    /// Override `CYRUS_CONFIG` with an explicit path.
    #[clap(short = 'C', long)]
    config: Option<PathBuf>,
}

pub fn run(args: DeliverArgs) -> Result<i32> {
    let config = match args.config {
        Some(path) => silo_config::read_config(path)?,
        None => silo_config::load_from_environment()?,
    };

    let paths = SpoolPaths::new(&config.spool.root);

    let dup_path = paths.db_dir().join("duplicate.db");
    let mut duplicates = DuplicateTable::open(&dup_path).context("opening duplicate suppression table")?;

    let mut body = Vec::new();
    std::io::stdin()
        .read_to_end(&mut body)
        .context("reading message from stdin")?;

    let request = DeliverRequest {
        recipients: args.recipients,
        return_path: args.from,
        ignore_quota: args.ignore_quota,
        suppress_duplicates: args.suppress_duplicates,
    };

    let namespace = config.namespace.namespace();
    let transport = Sendmail::default();
    let code = run_deliver(
        &paths,
        &namespace,
        &mut duplicates,
        &NoSieve,
        &transport,
        &config.spool.hostname,
        &request,
        &body,
        now_unix(),
    );
    Ok(code)
}
