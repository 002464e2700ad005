pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod entities;
pub mod model;
pub mod recognition;
pub mod remote;
pub mod store;
