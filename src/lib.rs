//! deli：并发虚拟用户驱动的HTTP(S)负载与压力测试引擎

pub mod core;
pub mod models;
