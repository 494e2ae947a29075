//! Runtime intrinsic identities.

use std::fmt;

/// Intrinsic functions declared by the surrounding runtime. The lifter
/// terminates blocks with these when it cannot statically continue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    Error,
    MissingBlock,
    FunctionCall,
    FunctionReturn,
    AsyncHyperCall,
    Jump,
    GetIndirectBrBlockAddress,
}

impl Intrinsic {
    /// Linkage name. Fixed so the runtime can resolve them.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::MissingBlock => "missing_block",
            Self::FunctionCall => "function_call",
            Self::FunctionReturn => "function_return",
            Self::AsyncHyperCall => "async_hyper_call",
            Self::Jump => "jump",
            Self::GetIndirectBrBlockAddress => "get_indirectbr_block_address",
        }
    }
}

impl fmt::Display for Intrinsic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Call target: an intrinsic or another lifted trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Callee {
    Intrinsic(Intrinsic),
    Lifted(crate::FuncId),
}
