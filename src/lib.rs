pub mod api;
pub mod capture;
pub mod config;
pub mod logging;
pub mod probe;
pub mod proxy;
pub mod replay;
pub mod storage;
pub mod tls;
