pub mod biological;
pub mod chemical;
pub mod config;
pub mod habitat;
pub mod report;
pub mod sites;
pub mod store;
