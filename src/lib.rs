pub mod api;
pub mod config;
pub mod db;
pub mod fetcher;
pub mod model;
pub mod pipeline;
pub mod resolver;
pub mod storage;
pub mod sweep;
