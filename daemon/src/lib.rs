pub mod arg_parser;
pub mod config;
pub mod dbus_service;
pub mod discovery;
pub mod dsm;
pub mod errors;
pub mod logger;
pub mod platform;
pub mod pm_watcher;
pub mod switcher;
