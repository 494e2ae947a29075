//! Trace lifter core for the a64rc static recompiler.
//!
//! Discovers basic blocks reachable from a set of guest entry points, lifts
//! each instruction's semantics into IR, wires the blocks into per-function
//! control-flow graphs (resolving register-indirect branches through
//! per-function address tables), flattens linear chains, and promotes the
//! guest register state from explicit state-structure traffic to SSA values
//! carried through join nodes.
//!
//! The sole programmatic entry is [`TraceLifter::lift`], driven against a
//! [`TraceManager`] and an architecture adapter such as [`Aarch64`]:
//!
//! ```
//! use a64rc_ir::Module;
//! use a64rc_lift::{Aarch64, MemoryTraceManager, TraceLifter};
//!
//! let mut manager = MemoryTraceManager::new();
//! manager.add_segment(0x1000, 0xD65F03C0u32.to_le_bytes().to_vec()); // ret
//! manager.add_function(0x1000, 0x1004);
//!
//! let mut module = Module::new();
//! let arch = Aarch64;
//! let mut lifter = TraceLifter::new(&mut manager, &arch, &mut module);
//! lifter
//!     .lift(0x1000, "sub_1000", &mut |addr, _func| {
//!         println!("lifted trace at {addr:#x}");
//!     })
//!     .unwrap();
//! ```

mod arch;
mod builder;
mod error;
mod flatten;
mod reg_info;
mod regflow;
mod trace;

pub use arch::*;
pub use builder::*;
pub use error::*;
pub use reg_info::*;
pub use trace::*;
