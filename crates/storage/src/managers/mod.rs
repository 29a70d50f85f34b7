pub mod channel;
pub mod ledger;
