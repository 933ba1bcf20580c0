pub mod agent;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod routes;
pub mod service;
pub mod share;
pub mod store;
