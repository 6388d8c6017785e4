pub mod schedule;
pub mod start;
pub mod workflow;
