//! Per-consumer view onto a shared instance.

use crate::callback::Callback;
use crate::common::CommonId;
use crate::types::{HandleState, Op, Visibility};
use std::any::Any;

/// The reference the instance itself holds on each of its handles. It is
/// dropped when deletion completes; anything above it was taken by callers.
pub(crate) const INSTANCE_REF: usize = 1;

/// One callback slot per operation kind.
#[derive(Default)]
pub(crate) struct Callbacks {
    slots: [Option<Callback>; 11],
}

impl Callbacks {
    pub(crate) fn slot(&mut self, op: Op) -> &mut Option<Callback> {
        &mut self.slots[op.index()]
    }

    pub(crate) fn is_set(&self, op: Op) -> bool {
        self.slots[op.index()].is_some()
    }

    pub(crate) fn take(&mut self, op: Op) -> Option<Callback> {
        self.slots[op.index()].take()
    }

    /// Drain every populated slot, in `Op::ALL` order.
    pub(crate) fn take_all(&mut self) -> Vec<(Op, Callback)> {
        Op::ALL
            .iter()
            .filter_map(|&op| self.take(op).map(|cb| (op, cb)))
            .collect()
    }
}

/// Opaque per-surface script operator tables, owned by the consumer.
#[derive(Default)]
pub(crate) struct ScriptOps {
    pub(crate) dbox: Option<Box<dyn Any>>,
    pub(crate) gbar: Option<Box<dyn Any>>,
}

pub(crate) struct Local {
    pub(crate) state: HandleState,
    pub(crate) refs: usize,
    /// Whether the instance still holds its [`INSTANCE_REF`]
    pub(crate) instance_held: bool,
    pub(crate) visible: Visibility,
    pub(crate) common: CommonId,
    pub(crate) cbs: Callbacks,
    pub(crate) ops: ScriptOps,
    pub(crate) data: Option<Box<dyn Any>>,
    /// Primary updates swallowed while not shown
    pub(crate) paused_updating: u32,
    /// Last mouse position fed, for move filtering
    pub(crate) last_mouse: Option<(f64, f64)>,
}

impl Local {
    pub(crate) fn new(common: CommonId, state: HandleState) -> Self {
        Self {
            state,
            refs: INSTANCE_REF,
            instance_held: true,
            visible: Visibility::Hidden,
            common,
            cbs: Callbacks::default(),
            ops: ScriptOps::default(),
            data: None,
            paused_updating: 0,
            last_mouse: None,
        }
    }

    /// Nothing but the instance keeps this handle alive.
    pub(crate) fn is_sole_reference(&self) -> bool {
        self.instance_held && self.refs == INSTANCE_REF
    }

    pub(crate) fn is_live(&self) -> bool {
        matches!(self.state, HandleState::Creating | HandleState::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_all_drains_in_order() {
        let mut cbs = Callbacks::default();
        *cbs.slot(Op::SizeChanged) = Some(Box::new(|_, _, _| {}));
        *cbs.slot(Op::Created) = Some(Box::new(|_, _, _| {}));
        assert!(cbs.is_set(Op::Created));

        let ops: Vec<Op> = cbs.take_all().into_iter().map(|(op, _)| op).collect();
        assert_eq!(ops, vec![Op::Created, Op::SizeChanged]);
        assert!(!cbs.is_set(Op::Created));
        assert!(cbs.take(Op::SizeChanged).is_none());
    }

    #[test]
    fn test_new_handle_holds_instance_ref() {
        let local = Local::new(CommonId(1), HandleState::Creating);
        assert!(local.is_sole_reference());
        assert!(local.is_live());
        assert_eq!(local.visible, Visibility::Hidden);
    }
}
