use thiserror::Error;

/// Lifter errors.
///
/// Per-block failures (unreadable bytes, undecodable instructions, semantic
/// errors) are not reported here; they are encoded into the IR as terminating
/// calls to the `error` / `missing_block` intrinsics and lifting continues.
#[derive(Error, Debug)]
pub enum LiftError {
    #[error("0x{0:x} is not a known function entry")]
    NotFunctionEntry(u64),
    #[error("analysis invariant violated: {0}")]
    Analysis(#[from] AnalysisError),
}

/// Fatal invariant violations in the flattener or the register-flow
/// analyzer. Callers should treat these as bugs, not runtime conditions.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("block b{0} has {1} successors at flatten time")]
    TooManySuccessors(u32, usize),
    #[error("unterminated block b{0} reached the analyzer")]
    MissingTerminator(u32),
    #[error("join node in block b{0} has {1} incomings for {2} predecessors")]
    PhiArityMismatch(u32, usize, usize),
    #[error("loop elimination failed to converge")]
    LoopEliminationDiverged,
}

pub type Result<T> = std::result::Result<T, LiftError>;
