//! Scenario-based tests for stagegate

mod concurrency;
mod gate_failure;
mod manual_dispatch;
mod promotion_rollback;
mod success_chain;
