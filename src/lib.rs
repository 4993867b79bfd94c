//! Automated BGP prefix-list policy management for Juniper routers.
//!
//! Otto BGP discovers BGP context from a fleet of routers over SSH,
//! extracts the peer AS numbers, generates router-scoped prefix-list
//! policies from IRR data through the external `bgpq4` tool, validates
//! them against always-on safety guardrails and optional RPKI VRP data,
//! and applies them over NETCONF with confirmed-commit semantics.
//!
//! This crate is a binary crate in disguise: the library exists so the
//! integration points can be tested, not to provide a stable API.

pub mod adapter;
pub mod artifacts;
pub mod asn;
pub mod audit;
pub mod collector;
pub mod config;
pub mod error;
pub mod generator;
pub mod guardrails;
pub mod inspector;
pub mod log;
pub mod netconf;
pub mod operation;
pub mod pipeline;
pub mod process;
pub mod proxy;
pub mod rollout;
pub mod rpki;
pub mod utils;

pub use self::config::Config;
pub use self::error::ExitError;
pub use self::operation::Operation;
