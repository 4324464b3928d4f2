//! Property-based tests for the architecture layer.
//!
//! Uses `proptest` to check invariants over random inputs:
//! - Imprecise IPs are exactly one instruction unit below the raw cursor value
//! - Frame pointer queries and stepping clones never disturb a context
//! - Branch resolution is idempotent
//! - Every computed window partition is well formed

use proptest::prelude::*;

use ia64_arch::abi::{
    FIRST_STACKED_REG, INSTRUCTION_UNIT, MAX_IREGS, MAX_REG_ARGS, MAX_STACKED_REGS,
};
use ia64_arch::compile::BranchTargets;
use ia64_arch::test_harness::*;
use ia64_arch::{
    ArchCompileState, FunctionShape, IA64_REGISTER_FILE, MachineContext, RegBank, UnwindCursor,
};

fn frame_chain() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((1u64..u64::MAX, any::<u64>()), 2..8)
}

fn function_shape() -> impl Strategy<Value = FunctionShape> {
    (
        0usize..20,
        any::<bool>(),
        0usize..120,
        prop::option::of(0usize..16),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        0i32..512,
    )
        .prop_map(
            |(
                num_params,
                has_this,
                num_global_locals,
                max_out_args,
                uses_localloc,
                has_exception_clauses,
                saves_return_value,
                needs_lmf,
                locals_size,
            )| FunctionShape {
                num_params,
                has_this,
                num_global_locals,
                max_out_args,
                uses_localloc,
                has_exception_clauses,
                saves_return_value,
                needs_lmf,
                locals_size,
            },
        )
}

proptest! {
    #[test]
    fn prop_ip_precision(pairs in frame_chain()) {
        let raw = pairs[0].0;
        let precise = MachineContext::from_signal(FrameChainCursor::from_pairs(&pairs));
        let imprecise = MachineContext::from_unwound(FrameChainCursor::from_pairs(&pairs));
        prop_assert_eq!(precise.ip().unwrap(), raw);
        prop_assert_eq!(imprecise.ip().unwrap(), raw - INSTRUCTION_UNIT);
    }

    #[test]
    fn prop_fp_does_not_mutate(pairs in frame_chain()) {
        let ctx = MachineContext::from_unwound(FrameChainCursor::from_pairs(&pairs));
        let sp = ctx.sp().unwrap();
        let ip = ctx.ip().unwrap();
        prop_assert_eq!(ctx.fp().unwrap(), pairs[1].1);
        prop_assert_eq!(ctx.sp().unwrap(), sp);
        prop_assert_eq!(ctx.ip().unwrap(), ip);
        prop_assert_eq!(ctx.cursor().depth(), 0);
    }

    #[test]
    fn prop_stepping_clone_keeps_original(pairs in frame_chain(), steps in 1usize..8) {
        let ctx = MachineContext::from_signal(FrameChainCursor::from_pairs(&pairs));
        let sp = ctx.sp().unwrap();
        let mut clone = ctx.cursor().clone();
        for _ in 0..steps {
            clone.step().unwrap();
        }
        prop_assert_eq!(ctx.sp().unwrap(), sp);
    }

    #[test]
    fn prop_branch_resolution_idempotent(
        bindings in prop::collection::vec(0usize..256, 1..16),
        sites in prop::collection::vec((0usize..256, any::<prop::sample::Index>()), 0..32),
    ) {
        let mut targets = BranchTargets::new();
        let labels: Vec<_> = bindings.iter().map(|_| targets.new_label()).collect();
        for (site, which) in &sites {
            targets.reference(site * 16, labels[which.index(labels.len())]).unwrap();
        }
        for (label, bundle) in labels.iter().zip(&bindings) {
            targets.bind(*label, bundle * 16).unwrap();
        }
        let first = targets.resolve().unwrap().to_vec();
        for (label, bundle) in labels.iter().zip(&bindings) {
            targets.bind(*label, bundle * 16).unwrap();
        }
        let second = targets.resolve().unwrap().to_vec();
        prop_assert_eq!(&first, &second);
        for branch in &first {
            prop_assert_eq!(
                branch.site as i64 + branch.displacement * 16,
                branch.target as i64
            );
        }
    }

    #[test]
    fn prop_window_partition_well_formed(shape in function_shape()) {
        let state = ArchCompileState::new(&shape).unwrap();
        let p = state.partition;
        prop_assert!(p.reg_local0 <= p.reg_out0);
        prop_assert!(usize::from(p.reg_out0) + usize::from(p.n_out_regs) <= MAX_IREGS);
        prop_assert!(usize::from(p.size_of_frame()) <= MAX_STACKED_REGS);
        prop_assert_eq!(
            usize::from(p.n_in_regs()),
            shape.num_args().min(MAX_REG_ARGS)
        );
        match shape.max_out_args {
            None => {
                prop_assert_eq!(p.n_out_regs, 0);
                prop_assert_eq!(p.reg_out0, p.reg_local0);
            }
            Some(n) => {
                prop_assert!(usize::from(p.n_local_regs()) >= n.min(MAX_REG_ARGS));
                prop_assert!(state.saved.b0.is_some());
            }
        }
        prop_assert_eq!(state.stack_alloc_size() % 16, 0);
        prop_assert!(state.localloc_offset() <= state.stack_alloc_size());

        let allocatable = IA64_REGISTER_FILE.allocatable(RegBank::Int);
        let saved = state.saved;
        for reg in [saved.ar_pfs, saved.b0, saved.sp, saved.fp, saved.return_val]
            .into_iter()
            .flatten()
        {
            prop_assert!(!allocatable.contains(reg));
            if shape.is_leaf() {
                prop_assert!(reg < FIRST_STACKED_REG);
            } else {
                prop_assert!((p.reg_local0..p.reg_out0).contains(&reg));
            }
        }
    }
}

#[test]
fn test_register_file_masks_disjoint() {
    let rf = IA64_REGISTER_FILE;
    assert!((rf.allocatable(RegBank::Int) & rf.callee_saved(RegBank::Int)).is_empty());
    assert!(rf.callee_saved(RegBank::Float).is_empty());
}
