//! CLI entry point: the long-running daemons (`lmtpd`, `fudd`), the
//! one-shot `deliver` tool an MTA shells out to, and a small `mupdate`
//! administrative client. There is deliberately no `imapd`/`proxyd`
//! subcommand here yet — the murder layer's resolver and connection
//! pool exist in `silo-proxy`, but nothing in this workspace speaks
//! the IMAP command grammar a front end would need to terminate
//! client connections, so there is no accept loop to wire up.

use anyhow::Result;
use clap::{Parser, Subcommand};

use silo::{deliver, fudd, lmtpd, mupdate};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One-shot local delivery: reads a message from stdin and
    /// delivers it to the given recipients, exiting with a sysexits
    /// code.
    Deliver(deliver::DeliverArgs),
    /// Runs the LMTP server daemon.
    Lmtpd(lmtpd::LmtpdArgs),
    /// Runs the fud-style mailbox status daemon.
    Fudd(fudd::FuddArgs),
    /// Talks to a mupdate server directly: activate, delete, or find
    /// a mailbox's location.
    Mupdate(mupdate::MupdateArgs),
}

fn init_tracing() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "silo=info");
    }
    tracing_subscriber::fmt::init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let exit_code = match cli.command {
        Command::Deliver(args) => deliver::run(args)?,
        Command::Lmtpd(args) => {
            lmtpd::run(args).await?;
            silo_store::EX_OK
        }
        Command::Fudd(args) => {
            fudd::run(args).await?;
            silo_store::EX_OK
        }
        Command::Mupdate(args) => {
            mupdate::run(args).await?;
            silo_store::EX_OK
        }
    };

    std::process::exit(exit_code);
}
