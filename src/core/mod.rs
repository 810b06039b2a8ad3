pub mod chain;
pub mod consensus;
pub mod difficulty;
pub mod ledger;
pub mod params;
pub mod script;
pub mod types;
