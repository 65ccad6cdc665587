//! Replies and unsolicited commands from the master.
//!
//! Replies are matched to their request by sequence number. Commands name
//! their instance by package and id, except `created` (keyed by the creation
//! timestamp) and `deleted` (either).

use super::{PendingReply, Route, Viewer};
use crate::buffer::BufferBackend;
use crate::callback::CbInfo;
use crate::common::{Common, CommonId};
use crate::conf::Config;
use crate::packet::{ArgReader, Packet};
use crate::status::{DboxError, Status};
use crate::types::{
    BufferType, Event, Fault, FaultKind, Handle, HandleState, Op, Pending, Rect, Size, Target,
    Visibility,
};

/// Commands the master may send unprompted. Each has one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Created,
    Deleted,
    Updated(Target),
    UpdateBegin(Target),
    UpdateEnd(Target),
    SizeChanged,
    PeriodChanged,
    GroupChanged,
    Pinup,
    UpdateMode,
    GbarCreated,
    GbarDestroyed,
    RequestCloseGbar,
    ExtraInfo,
    Scroll,
    AccessStatus,
    KeyStatus,
    FaultPackage,
    ExtraBufferCreated,
    ExtraBufferDestroyed,
    ExtraUpdated,
}

impl Command {
    fn parse(name: &str) -> Option<Self> {
        let cmd = match name {
            "created" => Command::Created,
            "deleted" => Command::Deleted,
            "dbox_updated" => Command::Updated(Target::Dbox),
            "gbar_updated" => Command::Updated(Target::Gbar),
            "dbox_update_begin" => Command::UpdateBegin(Target::Dbox),
            "dbox_update_end" => Command::UpdateEnd(Target::Dbox),
            "gbar_update_begin" => Command::UpdateBegin(Target::Gbar),
            "gbar_update_end" => Command::UpdateEnd(Target::Gbar),
            "size_changed" => Command::SizeChanged,
            "period_changed" => Command::PeriodChanged,
            "group_changed" => Command::GroupChanged,
            "pinup" => Command::Pinup,
            "update_mode" => Command::UpdateMode,
            "gbar_created" => Command::GbarCreated,
            "gbar_destroyed" => Command::GbarDestroyed,
            "request_close_gbar" => Command::RequestCloseGbar,
            "extra_info" => Command::ExtraInfo,
            "scroll" => Command::Scroll,
            "access_status" => Command::AccessStatus,
            "key_status" => Command::KeyStatus,
            "fault_package" => Command::FaultPackage,
            "extra_buffer_created" => Command::ExtraBufferCreated,
            "extra_buffer_destroyed" => Command::ExtraBufferDestroyed,
            "extra_updated" => Command::ExtraUpdated,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Everything a `created` notification carries.
struct CreatedInfo<'a> {
    timestamp: f64,
    pkgname: &'a str,
    id: Option<&'a str>,
    content: Option<&'a str>,
    dbox_size: Size,
    gbar_size: Size,
    cluster: &'a str,
    category: &'a str,
    dbox_file: Option<&'a str>,
    gbar_file: Option<&'a str>,
    auto_launch: Option<&'a str>,
    priority: f64,
    is_user: bool,
    pinup_supported: bool,
    dbox_type: BufferType,
    gbar_type: BufferType,
    period: f64,
    title: Option<&'a str>,
    is_pinned_up: bool,
    status: Status,
}

impl<'a> CreatedInfo<'a> {
    fn parse(r: &mut ArgReader<'a>) -> Result<Self, DboxError> {
        Ok(Self {
            timestamp: r.double()?,
            pkgname: r.str()?,
            id: r.opt_str()?,
            content: r.opt_str()?,
            dbox_size: Size::new(r.uint()?, r.uint()?),
            gbar_size: Size::new(r.uint()?, r.uint()?),
            cluster: r.str()?,
            category: r.str()?,
            dbox_file: r.opt_str()?,
            gbar_file: r.opt_str()?,
            auto_launch: r.opt_str()?,
            priority: r.double()?,
            is_user: r.flag()?,
            pinup_supported: r.flag()?,
            dbox_type: BufferType::from_code(r.int()?),
            gbar_type: BufferType::from_code(r.int()?),
            period: r.double()?,
            title: r.opt_str()?,
            is_pinned_up: r.flag()?,
            status: DboxError::from_code(r.int()?),
        })
    }

    fn apply(&self, common: &mut Common, conf: &Config, backend: &mut dyn BufferBackend) {
        common.set_id(self.id);
        common.set_content(self.content);
        common.set_size(self.dbox_size, conf);
        common.set_gbar_size(self.gbar_size);
        common.set_default_gbar_size(self.gbar_size);
        if let Err(e) = common.set_group(self.cluster, self.category) {
            tracing::debug!("{}: keeping group: {e}", self.pkgname);
        }
        common.set_auto_launch(self.auto_launch);
        common.set_title(self.title);
        common.priority = self.priority;
        common.is_user = self.is_user;
        common.pinup_supported = self.pinup_supported;
        common.is_pinned_up = self.is_pinned_up;
        common.period = self.period;
        common.dbox.kind = self.dbox_type;
        common.gbar.kind = self.gbar_type;

        for (target, file) in [(Target::Dbox, self.dbox_file), (Target::Gbar, self.gbar_file)] {
            if let Err(e) = common.set_buffer(target, file, backend) {
                tracing::warn!("{}: {} buffer: {e}", self.pkgname, target.prefix());
            }
            common.open_lock(target, &conf.lock_dir);
        }
    }
}

/// A buffer identity the surface already carries is not a failure here.
fn buffer_result(pkgname: &str, target: Target, status: Status) {
    match status {
        Ok(()) | Err(DboxError::Exist) => {}
        Err(e) => tracing::warn!("{pkgname}: {} buffer: {e}", target.prefix()),
    }
}

impl Viewer {
    pub(super) fn on_reply(&mut self, packet: Packet) {
        let Some(PendingReply { handle, route }) = self.replies.remove(&packet.seq) else {
            tracing::debug!("{}: reply #{} matches no request", packet.command, packet.seq);
            return;
        };
        let mut r = packet.reader();
        let status = if r.is_empty() {
            Err(DboxError::Fault)
        } else {
            r.int().and_then(DboxError::from_code)
        };
        tracing::debug!("{} #{}: {status:?}", packet.command, packet.seq);

        match route {
            Route::Hello => match status.and_then(|()| r.uint()) {
                Ok(count) => self.conf.extra_buffer_count = count as usize,
                Err(e) => tracing::warn!("handshake refused: {e}"),
            },
            Route::New(cid) => self.new_replied(cid, status),
            Route::Delete(cid) => self.delete_replied(cid, status),
            Route::Slot(op) => {
                if let Some(h) = handle {
                    self.slot_replied(h, op, status);
                }
            }
            Route::Signal(info) => self.deliver_info(handle, info, status.map(|()| 0)),
            Route::Acquire(_, info) => {
                let result = resource_of(status, &mut r);
                self.deliver_info(handle, info, result);
            }
            Route::AcquireExtra(target, idx, info) => {
                let result = resource_of(status, &mut r);
                if let (Ok(rid), Some(h)) = (result, handle) {
                    let count = self.conf.extra_buffer_count();
                    if let Ok(common) = self.common_of_mut(h) {
                        if let Err(e) = common.set_extra_buffer(target, idx, rid, count) {
                            tracing::debug!("{h}: extra buffer {idx}: {e}");
                        }
                    }
                }
                self.deliver_info(handle, info, result);
            }
        }
    }

    fn deliver_info(
        &mut self,
        handle: Option<Handle>,
        info: CbInfo,
        result: Result<u32, DboxError>,
    ) {
        let Some(h) = handle else {
            return;
        };
        if !self.handles.contains_key(&h) {
            info.fail(self, h, DboxError::Fault);
            return;
        }
        match info {
            CbInfo::Status(cb) => cb(self, h, result.map(|_| ())),
            CbInfo::Resource(cb) => cb(self, h, result),
        }
    }

    fn new_replied(&mut self, cid: CommonId, status: Status) {
        let Err(e) = status else {
            // Completed by the "created" notification.
            return;
        };
        let deleting = self
            .instance(cid)
            .is_ok_and(|c| c.state == HandleState::Deleting);
        if deleting {
            self.deliver_created(cid, Err(e));
            self.finish_deleted(cid);
        } else {
            self.fail_creation(cid, e);
        }
    }

    fn delete_replied(&mut self, cid: CommonId, status: Status) {
        match status {
            Ok(()) => {}
            Err(DboxError::NotExist) => self.finish_deleted(cid),
            Err(e) => {
                let Ok(common) = self.instance_mut(cid) else {
                    return;
                };
                tracing::warn!("{}: delete failed: {e}", common.pkgname);
                common.pending.remove(Pending::DELETED);
                common.state = HandleState::Active;
                for h in self.handles_of(cid) {
                    let Ok(local) = self.local_mut(h) else {
                        continue;
                    };
                    if local.state != HandleState::Deleting {
                        continue;
                    }
                    local.state = HandleState::Active;
                    if let Some(cb) = self.take_slot(h, Op::Deleted) {
                        cb(self, h, Err(e));
                    }
                }
            }
        }
    }

    fn slot_replied(&mut self, h: Handle, op: Op, status: Status) {
        let Err(e) = status else {
            // Completed by the matching notification.
            return;
        };
        let Ok(cid) = self.local(h).map(|l| l.common) else {
            return;
        };
        if let Ok(common) = self.instance_mut(cid) {
            common.pending.remove(op.flag());
        }
        if let Some(cb) = self.take_slot(h, op) {
            cb(self, h, Err(e));
        }
        // The instance vanished and only the instance itself still refers to
        // the handle: finish it here instead of waiting for "deleted".
        if e == DboxError::NotExist && self.local(h).is_ok_and(|l| l.is_sole_reference()) {
            self.deliver_deleted(h);
        }
    }

    pub(super) fn on_command(&mut self, packet: &Packet) -> Status {
        let Some(command) = Command::parse(&packet.command) else {
            tracing::warn!("unknown command {:?}", packet.command);
            return Err(DboxError::InvalidParameter);
        };
        let mut r = packet.reader();
        match command {
            Command::Created => return self.on_created(&mut r),
            Command::Deleted => return self.on_deleted(&mut r),
            Command::FaultPackage => {
                let fault = Fault {
                    kind: FaultKind::Deactivated,
                    pkgname: r.opt_str()?.map(str::to_string),
                    id: r.opt_str()?.map(str::to_string),
                    func: r.opt_str()?.map(str::to_string),
                };
                self.fault(&fault);
                return Ok(());
            }
            _ => {}
        }

        let pkgname = r.str()?;
        let id = r.str()?;
        let Some(cid) = self.find_common(pkgname, id) else {
            tracing::debug!("{}: no instance {pkgname}/{id}", packet.command);
            return Err(DboxError::NotExist);
        };

        match command {
            Command::Updated(target) => self.on_updated(cid, target, &mut r),
            Command::UpdateBegin(target) => {
                self.emit_all(cid, Event::update_begin(target));
                Ok(())
            }
            Command::UpdateEnd(target) => {
                self.emit_all(cid, Event::update_end(target));
                Ok(())
            }
            Command::SizeChanged => self.on_size_changed(cid, &mut r),
            Command::PeriodChanged => {
                let status = DboxError::from_code(r.int()?);
                let period = r.double()?;
                if status.is_ok() {
                    self.instance_mut(cid)?.period = period;
                }
                self.complete_op(cid, Op::PeriodChanged, Some(Event::PeriodChanged), status);
                Ok(())
            }
            Command::GroupChanged => {
                let status = DboxError::from_code(r.int()?);
                let cluster = r.str()?;
                let category = r.str()?;
                let status =
                    status.and_then(|()| self.instance_mut(cid)?.set_group(cluster, category));
                self.complete_op(cid, Op::GroupChanged, Some(Event::GroupChanged), status);
                Ok(())
            }
            Command::Pinup => {
                let status = DboxError::from_code(r.int()?);
                let pinned = r.flag()?;
                if status.is_ok() {
                    self.instance_mut(cid)?.is_pinned_up = pinned;
                }
                self.complete_op(cid, Op::Pinup, Some(Event::PinupChanged), status);
                Ok(())
            }
            Command::UpdateMode => {
                let status = DboxError::from_code(r.int()?);
                let active = r.flag()?;
                if status.is_ok() {
                    self.instance_mut(cid)?.is_active_update = active;
                }
                self.complete_op(cid, Op::UpdateMode, Some(Event::UpdateModeChanged), status);
                Ok(())
            }
            Command::GbarCreated => self.on_gbar_created(cid, &mut r),
            Command::GbarDestroyed => {
                let status = DboxError::from_code(r.int()?);
                if status.is_ok() {
                    let common = self.instance_mut(cid)?;
                    common.gbar_created = false;
                    common.gbar.buffer = None;
                    common.gbar.lock = None;
                }
                self.complete_op(cid, Op::GbarDestroyed, Some(Event::GbarDestroyed), status);
                Ok(())
            }
            Command::RequestCloseGbar => {
                let reason = DboxError::from_code(r.int()?);
                tracing::debug!("{pkgname}: close gbar requested ({reason:?})");
                self.emit_all(cid, Event::RequestCloseGbar);
                Ok(())
            }
            Command::ExtraInfo => {
                let content = r.opt_str()?;
                let title = r.opt_str()?;
                let icon = r.opt_str()?;
                let name = r.opt_str()?;
                let priority = r.double()?;
                let common = self.instance_mut(cid)?;
                common.set_content(content);
                common.set_title(title);
                common.set_alt_info(icon, name);
                common.priority = priority;
                self.emit_all(cid, Event::ExtraInfoUpdated);
                Ok(())
            }
            Command::Scroll => {
                let hold = r.flag()?;
                let common = self.instance_mut(cid)?;
                if common.hold_scroll == hold {
                    return Err(DboxError::Already);
                }
                common.hold_scroll = hold;
                let event = if hold {
                    Event::HoldScroll
                } else {
                    Event::ReleaseScroll
                };
                self.emit_all(cid, event);
                Ok(())
            }
            Command::AccessStatus => {
                let status = DboxError::from_code(r.int()?);
                self.complete_op(cid, Op::AccessEvent, None, status);
                Ok(())
            }
            Command::KeyStatus => {
                let status = DboxError::from_code(r.int()?);
                self.complete_op(cid, Op::KeyEvent, None, status);
                Ok(())
            }
            Command::ExtraBufferCreated | Command::ExtraBufferDestroyed => {
                let target = Target::from_flag(r.flag()?);
                let idx = r.uint()? as usize;
                let resource = r.uint()?;
                let count = self.conf.extra_buffer_count();
                let common = self.instance_mut(cid)?;
                let event = if command == Command::ExtraBufferCreated {
                    common.set_extra_buffer(target, idx, resource, count)?;
                    Event::extra_created(target)
                } else {
                    common.clear_extra_buffer(target, idx, count)?;
                    Event::extra_destroyed(target)
                };
                self.emit_all(cid, event);
                Ok(())
            }
            Command::ExtraUpdated => {
                let target = Target::from_flag(r.flag()?);
                let idx = r.uint()? as usize;
                let damage = Rect::new(r.uint()?, r.uint()?, r.uint()?, r.uint()?);
                let count = self.conf.extra_buffer_count();
                let common = self.instance_mut(cid)?;
                common.touch_extra_buffer(target, idx, count)?;
                common.set_damage(target, damage);
                self.emit_all(cid, Event::extra_updated(target));
                Ok(())
            }
            Command::Created | Command::Deleted | Command::FaultPackage => Ok(()),
        }
    }

    fn on_created(&mut self, r: &mut ArgReader<'_>) -> Status {
        let info = CreatedInfo::parse(r)?;
        let Some(cid) = self.find_by_timestamp(info.timestamp) else {
            return self.on_foreign_created(&info);
        };

        let common = self.commons.get_mut(&cid).ok_or(DboxError::InvalidParameter)?;
        common.pending.remove(Pending::CREATED);
        if info.status.is_ok() {
            info.apply(common, &self.conf, self.backend.as_mut());
        }

        if self.instance(cid)?.state == HandleState::Deleting {
            // Deleted before the provider finished creating it. The create
            // callbacks still run, then the delete proceeds.
            let status = info.status.and(Err(DboxError::Canceled));
            self.deliver_created(cid, status);
            let identified = self.instance(cid).is_ok_and(|c| c.is_identified());
            if !identified || self.send_delete(cid).is_err() {
                self.finish_deleted(cid);
            }
            return Ok(());
        }

        if let Err(e) = info.status {
            self.fail_creation(cid, e);
            return Ok(());
        }
        self.instance_mut(cid)?.state = HandleState::Active;
        for h in self.handles_of(cid) {
            if let Ok(local) = self.local_mut(h) {
                if local.state == HandleState::Creating {
                    local.state = HandleState::Active;
                }
            }
        }
        tracing::debug!("{} {}: created", info.pkgname, info.id.unwrap_or_default());
        self.deliver_created(cid, Ok(()));
        Ok(())
    }

    /// An instance created by someone else, typically by the system.
    fn on_foreign_created(&mut self, info: &CreatedInfo<'_>) -> Status {
        info.status?;
        let id = info.id.ok_or(DboxError::InvalidParameter)?;
        if self.find_common(info.pkgname, id).is_some() {
            tracing::debug!("{} {id}: already known", info.pkgname);
            return Err(DboxError::Exist);
        }

        let mut common = Common::new(
            info.pkgname,
            info.content,
            info.cluster,
            info.category,
            info.timestamp,
        );
        info.apply(&mut common, &self.conf, self.backend.as_mut());
        common.state = HandleState::Active;
        let cid = self.insert_common(common);
        let h = self.insert_local(cid, HandleState::Active);
        tracing::debug!("{h}: {} {id} appeared", info.pkgname);
        self.emit(h, Event::Created);
        Ok(())
    }

    fn on_deleted(&mut self, r: &mut ArgReader<'_>) -> Status {
        let pkgname = r.str()?;
        let timestamp = r.double()?;
        let id = r.opt_str()?;
        let reason = DboxError::from_code(r.int()?);

        let cid = id
            .and_then(|id| self.find_common(pkgname, id))
            .or_else(|| self.find_by_timestamp(timestamp))
            .ok_or(DboxError::NotExist)?;
        tracing::debug!("{pkgname} {}: deleted ({reason:?})", id.unwrap_or_default());
        self.finish_deleted(cid);
        Ok(())
    }

    fn on_updated(&mut self, cid: CommonId, target: Target, r: &mut ArgReader<'_>) -> Status {
        let file = r.opt_str()?;
        let damage = Rect::new(r.uint()?, r.uint()?, r.uint()?, r.uint()?);
        let frame_drop = self.conf.frame_drop();
        let manual_sync = self.conf.manual_sync();

        let common = self.commons.get_mut(&cid).ok_or(DboxError::InvalidParameter)?;
        if target == Target::Dbox && frame_drop && common.pending.contains(Pending::SIZE_CHANGED) {
            tracing::debug!("{}: update dropped during resize", common.pkgname);
            return Err(DboxError::Busy);
        }

        common.set_damage(target, damage);
        let status = common.set_buffer(target, file, self.backend.as_mut());
        buffer_result(&common.pkgname, target, status);
        common.open_lock(target, &self.conf.lock_dir);
        if !manual_sync {
            if let Err(e) = common.sync(target) {
                tracing::debug!("{}: sync {}: {e}", common.pkgname, target.prefix());
            }
        }

        for h in self.handles_of(cid) {
            if target == Target::Dbox {
                let Ok(local) = self.local_mut(h) else {
                    continue;
                };
                if local.visible != Visibility::Shown {
                    local.paused_updating += 1;
                    continue;
                }
            }
            self.emit(h, Event::updated(target));
        }
        Ok(())
    }

    fn on_size_changed(&mut self, cid: CommonId, r: &mut ArgReader<'_>) -> Status {
        let status = DboxError::from_code(r.int()?);
        let target = Target::from_flag(r.flag()?);
        let size = Size::new(r.uint()?, r.uint()?);
        let file = r.opt_str()?;

        if status.is_ok() {
            let common = self.commons.get_mut(&cid).ok_or(DboxError::InvalidParameter)?;
            match target {
                Target::Dbox => common.set_size(size, &self.conf),
                Target::Gbar => common.set_gbar_size(size),
            }
            let result = common.set_buffer(target, file, self.backend.as_mut());
            buffer_result(&common.pkgname, target, result);
            common.open_lock(target, &self.conf.lock_dir);
        }

        match target {
            Target::Dbox => {
                self.complete_op(cid, Op::SizeChanged, Some(Event::DboxSizeChanged), status)
            }
            Target::Gbar if status.is_ok() => self.emit_all(cid, Event::GbarSizeChanged),
            Target::Gbar => {}
        }
        Ok(())
    }

    fn on_gbar_created(&mut self, cid: CommonId, r: &mut ArgReader<'_>) -> Status {
        let file = r.opt_str()?;
        let size = Size::new(r.uint()?, r.uint()?);
        let status = DboxError::from_code(r.int()?);

        if status.is_ok() {
            let common = self.commons.get_mut(&cid).ok_or(DboxError::InvalidParameter)?;
            common.gbar_created = true;
            common.set_gbar_size(size);
            let result = common.set_buffer(Target::Gbar, file, self.backend.as_mut());
            buffer_result(&common.pkgname, Target::Gbar, result);
            common.open_lock(Target::Gbar, &self.conf.lock_dir);
        }
        self.complete_op(cid, Op::GbarCreated, Some(Event::GbarCreated), status);
        Ok(())
    }
}

fn resource_of(status: Status, r: &mut ArgReader<'_>) -> Result<u32, DboxError> {
    status?;
    match r.uint()? {
        0 => Err(DboxError::NotExist),
        rid => Ok(rid),
    }
}
