pub mod api;
pub mod cli;
pub mod commands;
pub mod crawl;
pub mod logging;
pub mod model;
pub mod recommend;
pub mod sites;
pub mod store;
