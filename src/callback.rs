//! Completion callbacks carried through a request round trip.

use crate::status::{DboxError, Status};
use crate::types::{Handle, Op};
use crate::viewer::Viewer;

/// Completion of a status-only request.
pub type Callback = Box<dyn FnOnce(&mut Viewer, Handle, Status)>;

/// Completion of a request answered with a resource id.
pub type ResourceCallback = Box<dyn FnOnce(&mut Viewer, Handle, Result<u32, DboxError>)>;

/// Box a closure as a [`Callback`].
pub fn callback<F>(f: F) -> Option<Callback>
where
    F: FnOnce(&mut Viewer, Handle, Status) + 'static,
{
    Some(Box::new(f))
}

/// Box a closure as a [`ResourceCallback`].
pub fn resource_callback<F>(f: F) -> ResourceCallback
where
    F: FnOnce(&mut Viewer, Handle, Result<u32, DboxError>) + 'static,
{
    Box::new(f)
}

/// Used whenever a caller passes no callback, so every slot is callable.
pub(crate) fn default_callback(op: &'static str) -> Callback {
    Box::new(move |_viewer, handle, status| match status {
        Ok(()) => tracing::debug!("{handle}: {op} done"),
        Err(e) => tracing::warn!("{handle}: {op} failed: {e}"),
    })
}

pub(crate) fn or_default(cb: Option<Callback>, op: Op) -> Callback {
    cb.unwrap_or_else(|| default_callback(op_name(op)))
}

pub(crate) fn op_name(op: Op) -> &'static str {
    match op {
        Op::Created => "create",
        Op::Deleted => "delete",
        Op::Pinup => "pinup",
        Op::GroupChanged => "change group",
        Op::PeriodChanged => "set period",
        Op::SizeChanged => "resize",
        Op::GbarCreated => "create gbar",
        Op::GbarDestroyed => "destroy gbar",
        Op::UpdateMode => "update mode",
        Op::AccessEvent => "access event",
        Op::KeyEvent => "key event",
    }
}

/// Registry entry for requests whose completion is not tied to a handle
/// slot. Created when the request is sent and consumed exactly once, by the
/// reply or by an error path.
pub(crate) enum CbInfo {
    Status(Callback),
    Resource(ResourceCallback),
}

impl CbInfo {
    pub(crate) fn fail(self, viewer: &mut Viewer, handle: Handle, err: DboxError) {
        match self {
            CbInfo::Status(cb) => cb(viewer, handle, Err(err)),
            CbInfo::Resource(cb) => cb(viewer, handle, Err(err)),
        }
    }
}

impl std::fmt::Debug for CbInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CbInfo::Status(_) => f.write_str("CbInfo::Status"),
            CbInfo::Resource(_) => f.write_str("CbInfo::Resource"),
        }
    }
}
