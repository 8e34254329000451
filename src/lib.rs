pub mod client;
pub mod clock;
pub mod config;
pub mod db;
pub mod driver;
pub mod mapper;
pub mod model;
pub mod output;
pub mod pagination;
pub mod partition;
pub mod retry;
pub mod state;
