//! Platform phase state machine.
//!
//! Transitions outside the table are refused: the current phase is kept and
//! the refusal logged, so a buggy caller can never teleport a platform
//! between unrelated states.

use std::collections::BTreeMap;

use tracing::warn;

use crate::crds::{ComponentPhase, ComponentStatus, PlatformPhase};

/// Permitted transitions out of each phase.
#[must_use]
pub fn allowed_targets(from: PlatformPhase) -> &'static [PlatformPhase] {
    use PlatformPhase as P;
    match from {
        P::Pending => &[P::Installing, P::Failed, P::Deleting],
        P::Installing => &[P::Ready, P::Degraded, P::Failed, P::Deleting],
        P::Ready => &[P::Degraded, P::Upgrading, P::Deleting],
        P::Degraded => &[P::Ready, P::Failed, P::Upgrading, P::Deleting],
        P::Upgrading => &[P::Ready, P::Degraded, P::Failed, P::Deleting],
        P::Failed => &[P::Installing, P::Deleting],
        P::Deleting => &[],
    }
}

#[must_use]
pub fn transition_allowed(from: PlatformPhase, to: PlatformPhase) -> bool {
    from == to || allowed_targets(from).contains(&to)
}

/// Move toward `desired`, refusing forbidden jumps.
///
/// A refused single step is retried through `Failed`-free intermediate
/// states where the table allows it (e.g. `Ready` reaches `Failed` only
/// through `Degraded`); otherwise the current phase is kept.
#[must_use]
pub fn transition(current: PlatformPhase, desired: PlatformPhase) -> PlatformPhase {
    if transition_allowed(current, desired) {
        return desired;
    }

    // One-hop path search keeps the machine honest without a planner.
    for step in allowed_targets(current) {
        if transition_allowed(*step, desired) {
            return *step;
        }
    }

    warn!(%current, %desired, "phase transition refused");
    current
}

/// Tie-break rules over enabled component statuses:
/// any Failed → Failed; some but not all Ready → Degraded; all Ready →
/// Ready; otherwise Installing.
#[must_use]
pub fn aggregate(components: &BTreeMap<String, ComponentStatus>) -> PlatformPhase {
    if components.is_empty() {
        return PlatformPhase::Ready;
    }
    if components
        .values()
        .any(|c| c.phase == ComponentPhase::Failed)
    {
        return PlatformPhase::Failed;
    }
    let ready = components
        .values()
        .filter(|c| c.phase == ComponentPhase::Ready)
        .count();
    if ready == components.len() {
        PlatformPhase::Ready
    } else if ready > 0 {
        PlatformPhase::Degraded
    } else {
        PlatformPhase::Installing
    }
}
