//! Autonomous iteration-control harness for coding agents.
//!
//! The loop repeatedly invokes an external agent against a workspace until a
//! deterministic check suite passes, a cost ceiling is crossed, or a stall
//! condition trips. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (cost parsing, budget, circuit
//!   breaker, stop reasons, plan parsing). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process execution,
//!   event reporting). Each behind a trait so tests can script it.
//!
//! Orchestration modules ([`step`], [`looping`]) coordinate core logic with
//! I/O to implement the CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
