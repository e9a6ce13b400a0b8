//! Ledger and relay adapters for the bounty core.
//!
//! `MockLedger` and `LocalRelay` are deterministic in-process collaborators
//! used by local runs and tests; `JsonRpcLedgerClient` talks to a ledger
//! gateway over HTTP.

#![deny(unsafe_code)]

mod ledger;
mod relay;
mod rpc;

pub use ledger::MockLedger;
pub use relay::LocalRelay;
pub use rpc::JsonRpcLedgerClient;
