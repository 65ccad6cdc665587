//! Operations exposed to application code.

use super::{Route, Viewer};
use crate::callback::{default_callback, or_default, Callback, CbInfo, ResourceCallback};
use crate::common::{Common, CommonId};
use crate::packet::Value;
use crate::registry::ObserverId;
use crate::status::{DboxError, Status};
use crate::types::{
    AccessEvent, BufferType, DeleteType, Event, Fault, Handle, HandleState, KeyEvent, MouseEvent,
    Op, Pending, Size, SizeType, Target, Visibility,
};
use std::any::Any;
use std::ops::ControlFlow;

/// Shortest update period a provider is asked for.
const MIN_PERIOD: f64 = 1.0;

fn clamp_period(period: f64) -> f64 {
    if (0.0..MIN_PERIOD).contains(&period) {
        MIN_PERIOD
    } else {
        period
    }
}

/// A signal emitted into a text-type instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextSignal<'a> {
    pub emission: &'a str,
    pub source: &'a str,
    pub sx: f64,
    pub sy: f64,
    pub ex: f64,
    pub ey: f64,
}

/// Replay the updates swallowed while the handle was not shown, as one.
fn replay_paused(v: &mut Viewer, h: Handle) {
    let Ok(local) = v.local_mut(h) else {
        return;
    };
    if local.visible != Visibility::Shown || local.paused_updating == 0 {
        return;
    }
    local.paused_updating = 0;
    v.emit(h, Event::DboxUpdated);
}

impl Viewer {
    /// Create an instance of `pkgname`, or alias an existing one with the same
    /// package, group, content and size when sharing is enabled.
    ///
    /// `cb` runs once the instance exists (or failed to).
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        pkgname: &str,
        content: Option<&str>,
        cluster: &str,
        category: &str,
        period: f64,
        size_type: SizeType,
        cb: Option<Callback>,
    ) -> Result<Handle, DboxError> {
        if pkgname.is_empty() || cluster.is_empty() || category.is_empty() {
            return Err(DboxError::InvalidParameter);
        }
        let period = clamp_period(period);
        let size = size_type.size();
        let cb = or_default(cb, Op::Created);

        if let Some(cid) = self.find_sharable(pkgname, content, size, cluster, category) {
            let state = self.instance(cid)?.state;
            let h = self.insert_local(cid, state);
            self.set_slot(h, Op::Created, cb);
            if state == HandleState::Active {
                self.job_add(h, |v, h| {
                    if let Some(cb) = v.take_slot(h, Op::Created) {
                        cb(v, h, Ok(()));
                    }
                })?;
            }
            tracing::debug!("{h}: sharing {pkgname}");
            return Ok(h);
        }

        let ts = self.timestamp();
        let mut common = Common::new(pkgname, content, cluster, category, ts);
        common.set_size(size, &self.conf);
        common.period = period;
        let args = vec![
            pkgname.into(),
            content.into(),
            cluster.into(),
            category.into(),
            ts.into(),
            period.into(),
            Value::try_from(size.width)?,
            Value::try_from(size.height)?,
        ];
        let cid = self.insert_common(common);
        let h = self.insert_local(cid, HandleState::Creating);
        if let Err(e) = self.request("new", args, Some(h), Route::New(cid)) {
            self.handles.remove(&h);
            self.commons.remove(&cid);
            return Err(e);
        }
        self.set_slot(h, Op::Created, cb);
        self.instance_mut(cid)?.pending.insert(Pending::CREATED);
        tracing::debug!("{h}: creating {pkgname} at {ts}");
        Ok(h)
    }

    /// Delete the instance behind `h`. A shared instance only loses this
    /// handle; the others keep it alive.
    pub fn delete(&mut self, h: Handle, delete_type: DeleteType, cb: Option<Callback>) -> Status {
        let local = self.local(h)?;
        if !local.is_live() {
            return Err(DboxError::InvalidParameter);
        }
        let cid = local.common;
        let common = self.instance(cid)?;
        let shared = common.refcnt() > 1;
        let in_flight = common.pending.contains(Pending::DELETED);
        let cb = or_default(cb, Op::Deleted);

        if shared {
            self.local_mut(h)?.state = HandleState::Deleting;
            self.set_slot(h, Op::Deleted, cb);
            return self.job_add(h, |v, h| {
                if let Some(cb) = v.take_slot(h, Op::Created) {
                    cb(v, h, Err(DboxError::Canceled));
                }
                v.deliver_deleted(h);
            });
        }
        if in_flight {
            return Err(DboxError::Busy);
        }

        // Marked before anything is sent so a create issued from a callback
        // cannot pick this instance up again.
        let common = self.instance_mut(cid)?;
        let prev = common.state;
        common.state = HandleState::Deleting;
        common.delete_type = delete_type;
        let identified = common.is_identified();
        let prev_local = std::mem::replace(&mut self.local_mut(h)?.state, HandleState::Deleting);
        self.set_slot(h, Op::Deleted, cb);

        if !identified {
            // Finished when the creation completes.
            return Ok(());
        }
        if let Err(e) = self.send_delete(cid) {
            self.instance_mut(cid)?.state = prev;
            self.local_mut(h)?.state = prev_local;
            self.take_slot(h, Op::Deleted);
            return Err(e);
        }
        Ok(())
    }

    fn check_idle(&self, h: Handle, cid: CommonId, op: Op) -> Status {
        if self.local(h)?.cbs.is_set(op) || self.instance(cid)?.pending.contains(op.flag()) {
            return Err(DboxError::Busy);
        }
        Ok(())
    }

    /// Send the first half of a two-phase operation.
    fn slot_request(
        &mut self,
        h: Handle,
        cid: CommonId,
        op: Op,
        command: &str,
        args: Vec<Value>,
        cb: Option<Callback>,
    ) -> Status {
        self.request(command, args, Some(h), Route::Slot(op))?;
        self.set_slot(h, op, or_default(cb, op));
        self.instance_mut(cid)?.pending.insert(op.flag());
        Ok(())
    }

    fn ident_args(&self, cid: CommonId) -> Result<Vec<Value>, DboxError> {
        let c = self.instance(cid)?;
        Ok(vec![c.pkgname.as_str().into(), c.id_str().into()])
    }

    pub fn resize(&mut self, h: Handle, size_type: SizeType, cb: Option<Callback>) -> Status {
        let cid = self.validate(h)?;
        self.check_idle(h, cid, Op::SizeChanged)?;
        let size = size_type.size();
        let common = self.instance(cid)?;
        if common.dbox.size == size {
            return Err(DboxError::Already);
        }

        if common.refcnt() > 1 {
            let cb = or_default(cb, Op::SizeChanged);
            return self.migrate(h, cid, size, cb);
        }

        let mut args = self.ident_args(cid)?;
        args.extend([Value::try_from(size.width)?, Value::try_from(size.height)?]);
        self.slot_request(h, cid, Op::SizeChanged, "resize", args, cb)
    }

    /// Resizing a shared instance would resize it for everyone, so the handle
    /// moves to an instance of the requested size instead.
    fn migrate(&mut self, h: Handle, from: CommonId, size: Size, cb: Callback) -> Status {
        let c = self.instance(from)?;
        let pkgname = c.pkgname.clone();
        let content = c.content.clone();
        let cluster = c.cluster.clone();
        let category = c.category.clone();
        let period = c.period;

        if let Some(to) =
            self.find_sharable(&pkgname, content.as_deref(), size, &cluster, &category)
        {
            let state = self.instance(to)?.state;
            self.move_handle(h, to);
            self.local_mut(h)?.state = state;
            self.set_slot(h, Op::SizeChanged, cb);
            if state == HandleState::Active {
                self.job_add(h, |v, h| {
                    if let Some(cb) = v.take_slot(h, Op::SizeChanged) {
                        cb(v, h, Ok(()));
                        v.emit(h, Event::DboxSizeChanged);
                    }
                })?;
            }
            return Ok(());
        }

        let ts = self.timestamp();
        let mut common = Common::new(&pkgname, content.as_deref(), &cluster, &category, ts);
        common.set_size(size, &self.conf);
        common.period = period;
        let args = vec![
            pkgname.as_str().into(),
            content.as_deref().into(),
            cluster.as_str().into(),
            category.as_str().into(),
            ts.into(),
            period.into(),
            Value::try_from(size.width)?,
            Value::try_from(size.height)?,
        ];
        let to = self.insert_common(common);
        if let Err(e) = self.request("new", args, Some(h), Route::New(to)) {
            self.commons.remove(&to);
            return Err(e);
        }
        self.move_handle(h, to);
        self.local_mut(h)?.state = HandleState::Creating;
        self.set_slot(h, Op::SizeChanged, cb);
        self.instance_mut(to)?.pending.insert(Pending::CREATED);
        Ok(())
    }

    pub fn set_period(&mut self, h: Handle, period: f64, cb: Option<Callback>) -> Status {
        let cid = self.validate(h)?;
        self.check_idle(h, cid, Op::PeriodChanged)?;
        let period = clamp_period(period);
        if self.instance(cid)?.period == period {
            return Err(DboxError::Already);
        }
        let mut args = self.ident_args(cid)?;
        args.push(period.into());
        self.slot_request(h, cid, Op::PeriodChanged, "set_period", args, cb)
    }

    pub fn set_group(
        &mut self,
        h: Handle,
        cluster: &str,
        category: &str,
        cb: Option<Callback>,
    ) -> Status {
        let cid = self.validate(h)?;
        if cluster.is_empty() || category.is_empty() {
            return Err(DboxError::InvalidParameter);
        }
        self.check_idle(h, cid, Op::GroupChanged)?;
        let c = self.instance(cid)?;
        if c.cluster == cluster && c.category == category {
            return Err(DboxError::Already);
        }
        let mut args = self.ident_args(cid)?;
        args.extend([Value::from(cluster), category.into()]);
        self.slot_request(h, cid, Op::GroupChanged, "change_group", args, cb)
    }

    pub fn set_pinup(&mut self, h: Handle, flag: bool, cb: Option<Callback>) -> Status {
        let cid = self.validate(h)?;
        let c = self.instance(cid)?;
        if !c.pinup_supported {
            return Err(DboxError::InvalidParameter);
        }
        if c.is_pinned_up == flag {
            return Err(DboxError::Already);
        }
        self.check_idle(h, cid, Op::Pinup)?;
        let mut args = self.ident_args(cid)?;
        args.push(flag.into());
        self.slot_request(h, cid, Op::Pinup, "pinup_changed", args, cb)
    }

    /// Ask the provider to push updates as they happen (`true`) or on its own
    /// schedule.
    pub fn set_update_mode(&mut self, h: Handle, active: bool, cb: Option<Callback>) -> Status {
        let cid = self.validate(h)?;
        self.check_idle(h, cid, Op::UpdateMode)?;
        if self.instance(cid)?.is_active_update == active {
            return Err(DboxError::Already);
        }
        let mut args = self.ident_args(cid)?;
        args.push(active.into());
        self.slot_request(h, cid, Op::UpdateMode, "update_mode", args, cb)
    }

    /// Open the detail surface, positioned relative to the instance.
    pub fn create_gbar(&mut self, h: Handle, x: f64, y: f64, cb: Option<Callback>) -> Status {
        let cid = self.validate(h)?;
        if self.instance(cid)?.gbar_created {
            return Err(DboxError::Already);
        }
        self.check_idle(h, cid, Op::GbarCreated)?;
        let mut args = self.ident_args(cid)?;
        args.extend([Value::from(x), y.into()]);
        self.slot_request(h, cid, Op::GbarCreated, "create_gbar", args, cb)?;
        self.instance_mut(cid)?.gbar_pos = (x, y);
        Ok(())
    }

    pub fn destroy_gbar(&mut self, h: Handle, cb: Option<Callback>) -> Status {
        let cid = self.validate(h)?;
        if !self.instance(cid)?.gbar_created {
            return Err(DboxError::InvalidParameter);
        }
        self.check_idle(h, cid, Op::GbarDestroyed)?;
        let args = self.ident_args(cid)?;
        self.slot_request(h, cid, Op::GbarDestroyed, "destroy_gbar", args, cb)
    }

    pub fn move_gbar(&mut self, h: Handle, x: f64, y: f64) -> Status {
        let cid = self.validate(h)?;
        let c = self.instance(cid)?;
        if !c.gbar_created {
            return Err(DboxError::InvalidParameter);
        }
        let size = c.gbar.size;
        let mut args = self.ident_args(cid)?;
        args.extend([
            Value::try_from(size.width)?,
            Value::try_from(size.height)?,
            x.into(),
            y.into(),
        ]);
        self.notify("gbar_move", args)?;
        self.instance_mut(cid)?.gbar_pos = (x, y);
        Ok(())
    }

    pub fn access_event(
        &mut self,
        h: Handle,
        event: AccessEvent,
        x: f64,
        y: f64,
        cb: Option<Callback>,
    ) -> Status {
        let cid = self.validate(h)?;
        self.check_idle(h, cid, Op::AccessEvent)?;
        let ts = self.timestamp();
        let mut args = self.ident_args(cid)?;
        args.extend([Value::from(ts), x.into(), y.into()]);
        self.slot_request(h, cid, Op::AccessEvent, event.name(), args, cb)
    }

    pub fn key_event(
        &mut self,
        h: Handle,
        event: KeyEvent,
        keycode: u32,
        cb: Option<Callback>,
    ) -> Status {
        let cid = self.validate(h)?;
        self.check_idle(h, cid, Op::KeyEvent)?;
        let ts = self.timestamp();
        let mut args = self.ident_args(cid)?;
        args.extend([Value::from(ts), Value::try_from(keycode)?]);
        self.slot_request(h, cid, Op::KeyEvent, event.name(), args, cb)
    }

    /// Forward a pointer event. Moves are dropped with `Busy` while the
    /// provider holds scrolling or when they travel less than the configured
    /// fraction of the surface width.
    pub fn feed_mouse_event(
        &mut self,
        h: Handle,
        target: Target,
        event: MouseEvent,
        x: f64,
        y: f64,
    ) -> Status {
        let cid = self.validate(h)?;
        let c = self.instance(cid)?;
        if target.is_gbar() && !c.gbar_created {
            return Err(DboxError::InvalidParameter);
        }
        if event == MouseEvent::Move {
            if target == Target::Dbox && !c.mouse_event {
                return Err(DboxError::InvalidParameter);
            }
            if c.hold_scroll {
                return Err(DboxError::Busy);
            }
            let threshold = self.conf.event_filter() * f64::from(c.surface(target).size.width);
            if let Some((lx, ly)) = self.local(h)?.last_mouse {
                if (x - lx).abs() < threshold && (y - ly).abs() < threshold {
                    return Err(DboxError::Busy);
                }
            }
        }

        let ts = self.timestamp();
        let mut args = self.ident_args(cid)?;
        args.extend([Value::from(ts), x.into(), y.into()]);
        self.notify(&format!("{}_{}", target.prefix(), event.name()), args)?;
        self.local_mut(h)?.last_mouse = match event {
            MouseEvent::Leave => None,
            _ => Some((x, y)),
        };
        Ok(())
    }

    /// Emit a signal into an instance rendered from a text description.
    pub fn emit_text_signal(
        &mut self,
        h: Handle,
        signal: &TextSignal<'_>,
        cb: Option<Callback>,
    ) -> Status {
        let cid = self.validate(h)?;
        let c = self.instance(cid)?;
        if c.dbox.kind != BufferType::Text && c.gbar.kind != BufferType::Text {
            return Err(DboxError::InvalidParameter);
        }
        let mut args = self.ident_args(cid)?;
        args.extend([
            Value::from(signal.emission),
            signal.source.into(),
            signal.sx.into(),
            signal.sy.into(),
            signal.ex.into(),
            signal.ey.into(),
        ]);
        let cb = cb.unwrap_or_else(|| default_callback("text signal"));
        self.request("text_signal", args, Some(h), Route::Signal(CbInfo::Status(cb)))
    }

    /// Show, pause or hide this consumer's view. Only one handle of an
    /// instance is shown at a time; showing one pauses the others.
    pub fn set_visibility(&mut self, h: Handle, state: Visibility) -> Status {
        let cid = self.validate(h)?;
        if state == Visibility::Error {
            return Err(DboxError::InvalidParameter);
        }
        if !self.instance(cid)?.is_user {
            return Err(DboxError::PermissionDenied);
        }

        let local = self.local(h)?;
        if local.visible == state {
            if state == Visibility::Shown && local.paused_updating > 0 {
                return self.job_add(h, replay_paused);
            }
            return Err(DboxError::Already);
        }

        if state == Visibility::Shown {
            for sibling in self.handles_of(cid) {
                if sibling == h {
                    continue;
                }
                if let Ok(other) = self.local_mut(sibling) {
                    if other.visible == Visibility::Shown {
                        other.visible = Visibility::HiddenPaused;
                    }
                }
            }
        }
        let local = self.local_mut(h)?;
        local.visible = state;
        let replay = state == Visibility::Shown && local.paused_updating > 0;
        self.update_visibility(cid);
        if replay {
            self.job_add(h, replay_paused)?;
        }
        Ok(())
    }

    // Buffers and resource ids

    /// Platform resource id of the surface's current buffer.
    pub fn resource_id(&self, h: Handle, target: Target) -> Result<u32, DboxError> {
        let buffer = self
            .common_of(h)?
            .surface(target)
            .buffer
            .as_ref()
            .ok_or(DboxError::NotExist)?;
        buffer.resource_id().ok_or(DboxError::InvalidParameter)
    }

    /// Ask the provider for a resource id it keeps alive until released.
    pub fn acquire_resource_id(
        &mut self,
        h: Handle,
        target: Target,
        cb: ResourceCallback,
    ) -> Status {
        let cid = self.validate(h)?;
        let args = self.ident_args(cid)?;
        let command = format!("{}_acquire_pixmap", target.prefix());
        self.request(&command, args, Some(h), Route::Acquire(target, CbInfo::Resource(cb)))
    }

    pub fn release_resource_id(&mut self, h: Handle, target: Target, resource: u32) -> Status {
        let cid = self.local(h)?.common;
        let mut args = self.ident_args(cid)?;
        args.push(Value::try_from(resource)?);
        self.notify(&format!("{}_release_pixmap", target.prefix()), args)
    }

    pub fn acquire_extra_resource_id(
        &mut self,
        h: Handle,
        target: Target,
        idx: usize,
        cb: ResourceCallback,
    ) -> Status {
        let cid = self.validate(h)?;
        if idx >= self.conf.extra_buffer_count() {
            return Err(DboxError::InvalidParameter);
        }
        let idx_arg = i32::try_from(idx).map_err(|_| DboxError::InvalidParameter)?;
        let mut args = self.ident_args(cid)?;
        args.push(idx_arg.into());
        let command = format!("{}_acquire_xpixmap", target.prefix());
        self.request(
            &command,
            args,
            Some(h),
            Route::AcquireExtra(target, idx, CbInfo::Resource(cb)),
        )
    }

    pub fn extra_resource_id(
        &self,
        h: Handle,
        target: Target,
        idx: usize,
    ) -> Result<u32, DboxError> {
        self.common_of(h)?
            .extra_buffer(target, idx, self.conf.extra_buffer_count())
    }

    /// Index of the extra buffer the provider touched most recently.
    pub fn last_extra_index(&self, h: Handle, target: Target) -> Result<usize, DboxError> {
        self.common_of(h)?
            .surface(target)
            .last_extra
            .ok_or(DboxError::NotExist)
    }

    /// Pixels of the last sync.
    pub fn acquire_buffer(&self, h: Handle, target: Target) -> Result<&[u8], DboxError> {
        let buffer = self
            .common_of(h)?
            .surface(target)
            .buffer
            .as_ref()
            .ok_or(DboxError::NotExist)?;
        Ok(buffer.pixels())
    }

    /// Copy the last damaged region now. Needed in manual sync mode.
    pub fn sync(&mut self, h: Handle, target: Target) -> Status {
        self.common_of_mut(h)?.sync(target)
    }

    // Observers

    pub fn add_event_handler<F>(&mut self, handler: F) -> ObserverId
    where
        F: FnMut(&mut Viewer, Handle, Event) -> ControlFlow<()> + 'static,
    {
        self.events.add(Box::new(handler))
    }

    pub fn remove_event_handler(&mut self, id: ObserverId) -> Status {
        self.events
            .remove(id)
            .then_some(())
            .ok_or(DboxError::NotExist)
    }

    pub fn add_fault_handler<F>(&mut self, handler: F) -> ObserverId
    where
        F: FnMut(&mut Viewer, &Fault) -> ControlFlow<()> + 'static,
    {
        self.faults.add(Box::new(handler))
    }

    pub fn remove_fault_handler(&mut self, id: ObserverId) -> Status {
        self.faults
            .remove(id)
            .then_some(())
            .ok_or(DboxError::NotExist)
    }

    // Queries

    /// Every handle that still resolves, including ones being deleted.
    pub fn handles(&self) -> Vec<Handle> {
        self.handles.keys().copied().collect()
    }

    /// `Destroyed` for handles that no longer resolve.
    pub fn state(&self, h: Handle) -> HandleState {
        self.local(h)
            .map(|l| l.state)
            .unwrap_or(HandleState::Destroyed)
    }

    pub fn pkgname(&self, h: Handle) -> Result<&str, DboxError> {
        Ok(&self.common_of(h)?.pkgname)
    }

    pub fn id(&self, h: Handle) -> Result<Option<&str>, DboxError> {
        Ok(self.common_of(h)?.id.as_deref())
    }

    pub fn content(&self, h: Handle) -> Result<&str, DboxError> {
        Ok(self.common_of(h)?.content_str())
    }

    pub fn title(&self, h: Handle) -> Result<Option<&str>, DboxError> {
        Ok(self.common_of(h)?.title.as_deref())
    }

    pub fn alt_icon(&self, h: Handle) -> Result<Option<&str>, DboxError> {
        Ok(self.common_of(h)?.alt_icon.as_deref())
    }

    pub fn alt_name(&self, h: Handle) -> Result<Option<&str>, DboxError> {
        Ok(self.common_of(h)?.alt_name.as_deref())
    }

    pub fn auto_launch(&self, h: Handle) -> Result<Option<&str>, DboxError> {
        Ok(self.common_of(h)?.auto_launch.as_deref())
    }

    pub fn size(&self, h: Handle, target: Target) -> Result<Size, DboxError> {
        Ok(self.common_of(h)?.surface(target).size)
    }

    pub fn default_gbar_size(&self, h: Handle) -> Result<Size, DboxError> {
        Ok(self.common_of(h)?.gbar_default_size)
    }

    pub fn size_type(&self, h: Handle) -> Result<Option<SizeType>, DboxError> {
        Ok(SizeType::from_size(self.common_of(h)?.dbox.size))
    }

    pub fn period(&self, h: Handle) -> Result<f64, DboxError> {
        Ok(self.common_of(h)?.period)
    }

    /// `(cluster, category)`
    pub fn group(&self, h: Handle) -> Result<(&str, &str), DboxError> {
        let c = self.common_of(h)?;
        Ok((&c.cluster, &c.category))
    }

    pub fn is_pinned_up(&self, h: Handle) -> Result<bool, DboxError> {
        Ok(self.common_of(h)?.is_pinned_up)
    }

    pub fn pinup_supported(&self, h: Handle) -> Result<bool, DboxError> {
        Ok(self.common_of(h)?.pinup_supported)
    }

    pub fn is_user(&self, h: Handle) -> Result<bool, DboxError> {
        Ok(self.common_of(h)?.is_user)
    }

    pub fn is_active_update(&self, h: Handle) -> Result<bool, DboxError> {
        Ok(self.common_of(h)?.is_active_update)
    }

    pub fn is_gbar_created(&self, h: Handle) -> Result<bool, DboxError> {
        Ok(self.common_of(h)?.gbar_created)
    }

    pub fn buffer_type(&self, h: Handle, target: Target) -> Result<BufferType, DboxError> {
        Ok(self.common_of(h)?.surface(target).kind)
    }

    pub fn priority(&self, h: Handle) -> Result<f64, DboxError> {
        Ok(self.common_of(h)?.priority)
    }

    pub fn visibility(&self, h: Handle) -> Result<Visibility, DboxError> {
        Ok(self.local(h)?.visible)
    }

    /// Number of handles aliasing the instance behind `h`.
    pub fn refcount(&self, h: Handle) -> Result<usize, DboxError> {
        Ok(self.common_of(h)?.refcnt())
    }

    pub fn set_data(&mut self, h: Handle, data: Box<dyn Any>) -> Status {
        self.local_mut(h)?.data = Some(data);
        Ok(())
    }

    pub fn data(&self, h: Handle) -> Option<&dyn Any> {
        self.local(h).ok()?.data.as_deref()
    }

    pub fn set_script_ops(&mut self, h: Handle, target: Target, ops: Box<dyn Any>) -> Status {
        let local = self.local_mut(h)?;
        match target {
            Target::Dbox => local.ops.dbox = Some(ops),
            Target::Gbar => local.ops.gbar = Some(ops),
        }
        Ok(())
    }

    pub fn script_ops(&self, h: Handle, target: Target) -> Option<&dyn Any> {
        let local = self.local(h).ok()?;
        match target {
            Target::Dbox => local.ops.dbox.as_deref(),
            Target::Gbar => local.ops.gbar.as_deref(),
        }
    }
}
