//! Packet-filter reconciliation daemon.
//!
//! This crate implements `iptsyncd`, which brings the live `iptables` and
//! `ip6tables` rule sets in line with a declarative desired-state file.
//!
//! # Responsibilities
//!
//! - Read the live rules via `iptables-save` / `ip6tables-save` (or a saved dump)
//! - Create missing user-defined chains and set built-in chain policies
//! - Delete absent rules and purge unrequested ones from managed chains
//! - Insert or replace named rules at the position their name dictates
//!
//! # Commands
//!
//! | Change | Command |
//! |--------|---------|
//! | create | `iptables -t <table> -I <chain> <pos> <args>` |
//! | update in place | `iptables -t <table> -R <chain> <pos> <args>` |
//! | delete / purge | `iptables -t <table> -D <chain> <args as dumped>` |
//! | new chain | `iptables -t <table> -N <chain>` |
//! | policy | `iptables -t <table> -P <chain> <POLICY>` |
//!
//! # Example
//!
//! ```ignore
//! use iptsyncd::{load_desired_state, ExecRunner, SyncMgr};
//!
//! let desired = load_desired_state(Path::new("/etc/iptsync/rules.json"))?;
//! let report = SyncMgr::new(ExecRunner).run_cycle(&desired).await?;
//! ```

pub mod accounts;
pub mod config;
pub mod error;
pub mod runner;
mod sync_mgr;

pub use accounts::SystemAccounts;
pub use config::{load_desired_state, parse_desired_state, ChainSpec, DesiredState};
pub use error::{SyncError, SyncResult};
pub use runner::{split_command, ExecRunner};
pub use sync_mgr::{filter_tool, save_tool, CycleReport, SyncMgr};
