pub mod config;
pub mod connectivity;
pub mod db;
pub mod feed;
pub mod model;
pub mod offline;
pub mod realtime;
pub mod replay;
pub mod session;
pub mod storage;
