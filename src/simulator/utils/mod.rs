pub mod log;
pub mod report;
