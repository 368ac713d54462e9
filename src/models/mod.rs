pub mod aggregate;
pub mod config;
pub mod request;
pub mod result;
pub mod stress_result;
pub mod verdict;
