pub mod fixture;
pub mod ledger;
pub mod user;
pub mod wager;
