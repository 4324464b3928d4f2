// Branch-target bookkeeping for the code buffer being emitted.
//
// Labels may be referenced before they are bound. Resolution runs once the buffer
// length is final and turns every reference into an IP-relative displacement in
// bundles, which is what IA-64 branch immediates encode.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use crate::abi::BUNDLE_SIZE;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// A branch whose displacement is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedBranch {
    /// Byte offset of the bundle holding the branch.
    pub site: usize,
    pub label: Label,
    pub target: usize,
    /// `(target - site) / BUNDLE_SIZE`.
    pub displacement: i64,
}

#[derive(Debug, Clone, Default)]
pub struct BranchTargets {
    targets: Vec<Option<usize>>,
    references: Vec<(usize, Label)>,
    resolved: Vec<ResolvedBranch>,
}

impl BranchTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.targets.len() as u32);
        self.targets.push(None);
        label
    }

    /// Bind `label` to `offset`. Binding again to the same offset is a no-op.
    pub fn bind(&mut self, label: Label, offset: usize) -> Result<()> {
        check_aligned(offset)?;
        let slot = self.slot_mut(label)?;
        match *slot {
            Some(old) if old != offset => Err(Error::LabelRebound {
                label: label.0,
                old,
                new: offset,
            }),
            _ => {
                *slot = Some(offset);
                Ok(())
            }
        }
    }

    /// Record a branch at `site` to `label`, bound or not.
    pub fn reference(&mut self, site: usize, label: Label) -> Result<()> {
        check_aligned(site)?;
        self.slot_mut(label)?;
        self.references.push((site, label));
        Ok(())
    }

    pub fn target(&self, label: Label) -> Option<usize> {
        self.targets.get(label.0 as usize).copied().flatten()
    }

    /// Number of references whose label is not bound yet.
    pub fn pending(&self) -> usize {
        self.references
            .iter()
            .filter(|(_, label)| self.target(*label).is_none())
            .count()
    }

    pub fn resolved(&self) -> &[ResolvedBranch] {
        &self.resolved
    }

    /// Compute displacements for every reference.
    ///
    /// Fails on the first reference to a label that was never bound; a dangling
    /// forward branch cannot be emitted.
    pub fn resolve(&mut self) -> Result<&[ResolvedBranch]> {
        let mut resolved = Vec::with_capacity(self.references.len());
        for &(site, label) in &self.references {
            let target = self
                .target(label)
                .ok_or(Error::UnresolvedBranchTarget {
                    label: label.0,
                    site,
                })?;
            let displacement = (target as i64 - site as i64) / BUNDLE_SIZE as i64;
            tracing::trace!(site, target, displacement, "resolved branch to L{}", label.0);
            resolved.push(ResolvedBranch {
                site,
                label,
                target,
                displacement,
            });
        }
        self.resolved = resolved;
        Ok(&self.resolved)
    }

    fn slot_mut(&mut self, label: Label) -> Result<&mut Option<usize>> {
        self.targets
            .get_mut(label.0 as usize)
            .ok_or_else(|| Error::Internal(format!("unknown label L{}", label.0)))
    }
}

fn check_aligned(offset: usize) -> Result<()> {
    if offset % BUNDLE_SIZE == 0 {
        Ok(())
    } else {
        Err(Error::MisalignedBranch(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_reference() {
        let mut targets = BranchTargets::new();
        let label = targets.new_label();
        targets.reference(0x10, label).unwrap();
        assert_eq!(targets.pending(), 1);
        targets.bind(label, 0x40).unwrap();
        assert_eq!(targets.pending(), 0);

        let resolved = targets.resolve().unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].displacement, 3);
    }

    #[test]
    fn test_backward_reference() {
        let mut targets = BranchTargets::new();
        let head = targets.new_label();
        targets.bind(head, 0x20).unwrap();
        targets.reference(0x60, head).unwrap();
        assert_eq!(targets.resolve().unwrap()[0].displacement, -4);
    }

    #[test]
    fn test_unbound_label_is_fatal() {
        let mut targets = BranchTargets::new();
        let label = targets.new_label();
        targets.reference(0x30, label).unwrap();
        assert!(matches!(
            targets.resolve(),
            Err(Error::UnresolvedBranchTarget { label: 0, site: 0x30 })
        ));
    }

    #[test]
    fn test_rebinding() {
        let mut targets = BranchTargets::new();
        let label = targets.new_label();
        targets.bind(label, 0x40).unwrap();
        targets.bind(label, 0x40).unwrap();
        assert!(matches!(
            targets.bind(label, 0x50),
            Err(Error::LabelRebound {
                old: 0x40,
                new: 0x50,
                ..
            })
        ));
        assert_eq!(targets.target(label), Some(0x40));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let mut targets = BranchTargets::new();
        let a = targets.new_label();
        let b = targets.new_label();
        targets.reference(0x0, a).unwrap();
        targets.reference(0x10, b).unwrap();
        targets.bind(a, 0x80).unwrap();
        targets.bind(b, 0x0).unwrap();
        let first = targets.resolve().unwrap().to_vec();
        targets.bind(a, 0x80).unwrap();
        let second = targets.resolve().unwrap().to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn test_misaligned_offsets() {
        let mut targets = BranchTargets::new();
        let label = targets.new_label();
        assert!(matches!(targets.bind(label, 0x41), Err(Error::MisalignedBranch(0x41))));
        assert!(matches!(
            targets.reference(0x8, label),
            Err(Error::MisalignedBranch(0x8))
        ));
    }

    #[test]
    fn test_unknown_label() {
        let mut targets = BranchTargets::new();
        assert!(targets.reference(0, Label(7)).is_err());
    }
}
