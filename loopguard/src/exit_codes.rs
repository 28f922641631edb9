//! Stable exit codes for loopguard CLI commands.

/// All checks pass.
pub const OK: i32 = 0;
/// Invalid configuration/state or an unrecoverable runtime error.
pub const INVALID: i32 = 1;
/// Circuit breaker tripped (no progress, same error) or max iterations reached.
pub const CIRCUIT_BREAKER: i32 = 2;
/// External kill switch disabled the loop.
pub const KILL_SWITCH: i32 = 3;
/// Accumulated cost exceeded `budget_max_usd`.
pub const BUDGET_EXCEEDED: i32 = 4;
/// Workflow wall-clock timeout exceeded.
pub const TIMEOUT: i32 = 5;
/// Interrupted by SIGINT/SIGTERM (128 + 2).
pub const INTERRUPTED: i32 = 130;
