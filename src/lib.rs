pub mod caption;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod instagram;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod session;
