use oxidx::dx;
use smallvec::SmallVec;
use tracing::warn;

use super::types::ResourceStates;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum PendingBarrier<R> {
    Transition {
        resource: R,
        before: ResourceStates,
        after: ResourceStates,
    },
    UnorderedAccess {
        resource: R,
    },
}

/// Coalesces transition/UAV barriers per resource into a single flush point.
/// Generic over the resource handle so the collapse rules are testable; the
/// command context instantiates it with `dx::Resource`.
#[derive(Debug)]
pub struct BarrierBatcher<R = dx::Resource> {
    pending: SmallVec<[PendingBarrier<R>; 8]>,
}

impl<R> Default for BarrierBatcher<R> {
    fn default() -> Self {
        Self {
            pending: SmallVec::new(),
        }
    }
}

impl<R: Clone + PartialEq> BarrierBatcher<R> {
    /// Records a transition, collapsing against an already-pending one for
    /// the same resource. The first pending transition wins the scan: when
    /// its recorded `after` equals the incoming `before`, the pair either
    /// cancels (net no-op round trip) or merges into one wider transition.
    pub fn add_transition(&mut self, resource: &R, before: ResourceStates, after: ResourceStates) {
        if before == after {
            return;
        }

        for (index, pending) in self.pending.iter_mut().enumerate() {
            let PendingBarrier::Transition {
                resource: pending_resource,
                before: pending_before,
                after: pending_after,
            } = pending
            else {
                continue;
            };

            if pending_resource != resource {
                continue;
            }

            if *pending_after != before {
                // The tracked state diverged from what the caller believes;
                // take the new target to keep the GPU state machine moving.
                warn!(
                    target: "rhi::barriers",
                    "transition chain mismatch: pending after {:?}, incoming before {:?}",
                    pending_after, before
                );
            }

            if *pending_before == after {
                self.pending.remove(index);
            } else {
                *pending_after = after;
            }

            return;
        }

        self.pending.push(PendingBarrier::Transition {
            resource: resource.clone(),
            before,
            after,
        });
    }

    pub fn add_unordered_access(&mut self, resource: &R) {
        self.pending.push(PendingBarrier::UnorderedAccess {
            resource: resource.clone(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    fn pending_for(&self, resource: &R) -> Vec<&PendingBarrier<R>> {
        self.pending
            .iter()
            .filter(|p| match p {
                PendingBarrier::Transition { resource: r, .. } => r == resource,
                PendingBarrier::UnorderedAccess { resource: r } => r == resource,
            })
            .collect()
    }
}

impl BarrierBatcher<dx::Resource> {
    /// Issues every accumulated barrier in one call and clears the list.
    /// Must run before any draw/dispatch/copy/resolve that depends on the
    /// recorded states.
    pub fn flush(&mut self, list: &dx::GraphicsCommandList) {
        if self.pending.is_empty() {
            return;
        }

        let barriers = self
            .pending
            .iter()
            .map(|pending| match pending {
                PendingBarrier::Transition {
                    resource,
                    before,
                    after,
                } => dx::ResourceBarrier::transition(
                    resource,
                    before.as_raw(),
                    after.as_raw(),
                    None,
                ),
                PendingBarrier::UnorderedAccess { resource } => {
                    dx::ResourceBarrier::uav(resource)
                }
            })
            .collect::<SmallVec<[_; 8]>>();

        list.resource_barrier(&barriers);
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COPY_DST: ResourceStates = ResourceStates::CopyDst;
    const COPY_SRC: ResourceStates = ResourceStates::CopySrc;
    const UAV: ResourceStates = ResourceStates::UnorderedAccess;

    #[test]
    fn no_op_transitions_are_rejected() {
        let mut batcher: BarrierBatcher<u32> = BarrierBatcher::default();

        batcher.add_transition(&1, COPY_DST, COPY_DST);
        assert!(batcher.is_empty());
    }

    #[test]
    fn round_trip_cancels_to_nothing() {
        let mut batcher: BarrierBatcher<u32> = BarrierBatcher::default();

        batcher.add_transition(&1, COPY_DST, COPY_SRC);
        batcher.add_transition(&1, COPY_SRC, COPY_DST);

        assert!(batcher.is_empty());
    }

    #[test]
    fn chained_transitions_merge_into_one() {
        let mut batcher: BarrierBatcher<u32> = BarrierBatcher::default();

        batcher.add_transition(&1, COPY_DST, COPY_SRC);
        batcher.add_transition(&1, COPY_SRC, UAV);

        assert_eq!(batcher.len(), 1);
        assert_eq!(
            batcher.pending_for(&1),
            vec![&PendingBarrier::Transition {
                resource: 1,
                before: COPY_DST,
                after: UAV,
            }]
        );
    }

    #[test]
    fn distinct_resources_do_not_interfere() {
        let mut batcher: BarrierBatcher<u32> = BarrierBatcher::default();

        batcher.add_transition(&1, COPY_DST, COPY_SRC);
        batcher.add_transition(&2, COPY_SRC, COPY_DST);

        assert_eq!(batcher.len(), 2);
        assert_eq!(batcher.pending_for(&1).len(), 1);
        assert_eq!(batcher.pending_for(&2).len(), 1);
    }

    #[test]
    fn uav_barriers_are_untouched_by_transition_collapse() {
        let mut batcher: BarrierBatcher<u32> = BarrierBatcher::default();

        batcher.add_unordered_access(&1);
        batcher.add_transition(&1, UAV, COPY_SRC);
        batcher.add_transition(&1, COPY_SRC, UAV);

        // The transition pair cancels; the UAV barrier stays.
        assert_eq!(batcher.len(), 1);
        assert_eq!(
            batcher.pending_for(&1),
            vec![&PendingBarrier::UnorderedAccess { resource: 1 }]
        );
    }
}
