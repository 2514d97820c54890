pub mod db;
pub mod engine;
pub mod graph;
pub mod lock;
pub mod participant;
pub mod session;
pub mod settings;
