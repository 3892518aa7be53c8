//! Test modules for the agent crate

mod merger_tests;
mod scheduler_tests;
mod sender_tests;
mod storage_tests;
