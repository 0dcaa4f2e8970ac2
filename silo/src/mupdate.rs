//! `mupdate`: a thin administrative client for the mupdate protocol,
//! in the tradition of Cyrus's own mupdate test/debug tooling — talks
//! to a mupdate server directly rather than through the backend map a
//! running proxy maintains, for one-off activate/delete/find calls
//! from a shell.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use silo_proxy::MupdateClient;

#[derive(Args, Debug)]
pub struct MupdateArgs {
    #[clap(subcommand)]
    command: MupdateCommand,

    /// Address of the mupdate server to talk to.
    #[clap(short, long)]
    server: SocketAddr,
}

#[derive(Subcommand, Debug)]
enum MupdateCommand {
    /// Registers (or re-registers) a mailbox's location.
    Activate {
        mailbox: String,
        backend_server: String,
        acl: String,
    },
    /// Removes a mailbox's location entry.
    Delete { mailbox: String },
    /// Looks up a mailbox's current location.
    Find { mailbox: String },
}

pub async fn run(args: MupdateArgs) -> Result<()> {
    let mut client = MupdateClient::connect(&args.server.to_string())
        .await
        .with_context(|| format!("connecting to mupdate server at {}", args.server))?;

    match args.command {
        MupdateCommand::Activate {
            mailbox,
            backend_server,
            acl,
        } => {
            client.activate(&mailbox, &backend_server, &acl).await?;
            println!("activated {mailbox} on {backend_server}");
        }
        MupdateCommand::Delete { mailbox } => {
            client.delete(&mailbox).await?;
            println!("deleted {mailbox}");
        }
        MupdateCommand::Find { mailbox } => match client.find(&mailbox).await? {
            Some(location) => {
                println!("{} {} {}", location.mailbox, location.server, location.acl);
            }
            None => {
                println!("{mailbox}: not found");
            }
        },
    }

    Ok(())
}
