//! Subcommand implementations for the `silo` binary, split out into a
//! library target so integration tests can drive them directly
//! instead of shelling out to the compiled binary.

pub mod deliver;
pub mod fudd;
pub mod lmtpd;
pub mod mupdate;
pub mod signals;
