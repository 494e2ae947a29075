//! CFG flattening: merge linear block chains.
//!
//! Any block whose terminator has a single successor with a single
//! predecessor absorbs that successor. Runs only on traces without an
//! indirect-branch dispatcher, before register-flow analysis (so no join
//! nodes exist yet).

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use a64rc_ir::{BlockId, Func};

use crate::error::AnalysisError;
use crate::reg_info::BBRegInfo;

pub(crate) fn run(
    func: &mut Func,
    bb_parents: &mut FxHashMap<BlockId, FxHashSet<BlockId>>,
    reg_info: &mut FxHashMap<BlockId, BBRegInfo>,
) -> Result<(), AnalysisError> {
    let Some(entry) = func.entry() else {
        return Ok(());
    };

    let mut queue = VecDeque::from([entry]);
    let mut visited = FxHashSet::default();
    visited.insert(entry);
    let mut merged = 0usize;

    while let Some(block) = queue.pop_front() {
        // Re-examine the block after every merge; the spliced-in terminator
        // may expose another mergeable chain link.
        loop {
            let term = func
                .term(block)
                .ok_or(AnalysisError::MissingTerminator(block.0))?;
            let succs = term.successors();
            if succs.len() > 2 {
                return Err(AnalysisError::TooManySuccessors(block.0, succs.len()));
            }

            let mergeable = match succs.as_slice() {
                [succ] => {
                    *succ != block
                        && bb_parents.get(succ).map(|s| s.len()) == Some(1)
                }
                _ => false,
            };
            if !mergeable {
                for succ in succs {
                    if visited.insert(succ) {
                        queue.push_back(succ);
                    }
                }
                break;
            }

            let succ = succs[0];
            splice(func, block, succ);

            // The successor's traffic folds into the merged block; the later
            // write wins for latest values.
            if let Some(succ_info) = reg_info.remove(&succ) {
                reg_info.entry(block).or_default().merge_from(&succ_info);
            }

            // Children of the removed block now descend from the merged one.
            for child in func.successors(block) {
                if let Some(parents) = bb_parents.get_mut(&child) {
                    parents.remove(&succ);
                    parents.insert(block);
                }
            }
            bb_parents.remove(&succ);
            func.remove_block(succ);
            visited.remove(&succ);
            merged += 1;
        }
    }

    if merged > 0 {
        trace!(merged, "flattened linear chains");
    }
    Ok(())
}

/// Move the successor's instructions and terminator into `block`.
fn splice(func: &mut Func, block: BlockId, succ: BlockId) {
    let mut donor_insts = std::mem::take(&mut func.block_mut(succ).insts);
    let donor_term = func.take_term(succ);
    func.take_term(block);
    func.block_mut(block).insts.append(&mut donor_insts);
    if let Some(term) = donor_term {
        func.set_term(block, term);
    }
}
