// Library for tests to access modules

pub mod backend;
pub mod config;
pub mod deadline;
pub mod error;
pub mod history_repo;
pub mod maintenance_worker;
pub mod models;
pub mod scheduler;
pub mod script_runner;
pub mod vault;
pub mod version;
pub mod worker;
