//! The viewer session object.
//!
//! [`Viewer`] owns every shared instance and local handle, the observer
//! registries, the table of requests awaiting a reply and the deferred job
//! queue. Everything runs on one thread: callbacks and observers receive
//! `&mut Viewer` and may call straight back into the API.

mod api;
mod router;

pub use api::TextSignal;

use crate::buffer::BufferBackend;
use crate::callback::{op_name, Callback, CbInfo};
use crate::common::{Common, CommonId};
use crate::conf::Config;
use crate::handle::Local;
use crate::packet::{Packet, PacketKind, Value};
use crate::registry::{self, EventHandler, FaultHandler, Registry};
use crate::status::{DboxError, Status};
use crate::transport::Transport;
use crate::types::{Event, Fault, Handle, HandleState, Op, Pending, Size, Target, Visibility};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// What the reply to a request completes.
#[derive(Debug)]
pub(crate) enum Route {
    Hello,
    New(CommonId),
    Delete(CommonId),
    /// First half of an operation finished by a later notification
    Slot(Op),
    Signal(CbInfo),
    Acquire(Target, CbInfo),
    AcquireExtra(Target, usize, CbInfo),
}

#[derive(Debug)]
pub(crate) struct PendingReply {
    handle: Option<Handle>,
    route: Route,
}

type JobFn = Box<dyn FnOnce(&mut Viewer, Handle)>;

struct Job {
    handle: Handle,
    run: JobFn,
}

pub struct Viewer {
    pub(crate) conf: Config,
    commons: BTreeMap<CommonId, Common>,
    handles: BTreeMap<Handle, Local>,
    replies: HashMap<u32, PendingReply>,
    pub(crate) events: Registry<EventHandler>,
    pub(crate) faults: Registry<FaultHandler>,
    jobs: VecDeque<Job>,
    transport: Option<Box<dyn Transport>>,
    backend: Box<dyn BufferBackend>,
    next_id: u64,
    next_seq: u32,
    last_timestamp: f64,
}

impl fmt::Debug for Viewer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Viewer")
            .field("commons", &self.commons.len())
            .field("handles", &self.handles.len())
            .field("replies", &self.replies.len())
            .field("jobs", &self.jobs.len())
            .field("connected", &self.transport.is_some())
            .finish()
    }
}

impl Viewer {
    pub fn new(conf: Config, backend: Box<dyn BufferBackend>) -> Self {
        Self {
            conf,
            commons: BTreeMap::new(),
            handles: BTreeMap::new(),
            replies: HashMap::new(),
            events: Registry::default(),
            faults: Registry::default(),
            jobs: VecDeque::new(),
            transport: None,
            backend,
            next_id: 0,
            next_seq: 0,
            last_timestamp: 0.0,
        }
    }

    pub fn conf(&self) -> &Config {
        &self.conf
    }

    /// Start using a fresh master connection.
    pub fn attach(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Announce this viewer to the master. The reply carries the number of
    /// extra buffers providers may expose.
    pub fn hello(&mut self, direct_path: Option<&str>) -> Status {
        self.request("acquire", vec![direct_path.into()], None, Route::Hello)
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Creation timestamps key instances until the provider names them, so
    /// they must never repeat.
    fn timestamp(&mut self) -> f64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let ts = if now > self.last_timestamp {
            now
        } else {
            f64::from_bits(self.last_timestamp.to_bits() + 1)
        };
        self.last_timestamp = ts;
        ts
    }

    pub(crate) fn request(
        &mut self,
        command: &str,
        args: Vec<Value>,
        handle: Option<Handle>,
        route: Route,
    ) -> Status {
        let Some(transport) = self.transport.as_mut() else {
            tracing::debug!("{command}: not connected");
            return Err(DboxError::Fault);
        };
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        let seq = self.next_seq;

        let mut packet = Packet::request(command, args);
        packet.seq = seq;
        if let Err(e) = transport.send(packet) {
            tracing::warn!("{command}: {e:#}");
            return Err(DboxError::Fault);
        }
        self.replies.insert(seq, PendingReply { handle, route });
        Ok(())
    }

    pub(crate) fn notify(&mut self, command: &str, args: Vec<Value>) -> Status {
        let Some(transport) = self.transport.as_mut() else {
            return Err(DboxError::Fault);
        };
        transport.send(Packet::notify(command, args)).map_err(|e| {
            tracing::warn!("{command}: {e:#}");
            DboxError::Fault
        })
    }

    fn send_reply(&mut self, seq: u32, command: &str, status: Status) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let code = crate::status::status_code(status);
        if let Err(e) = transport.send(Packet::reply(seq, command, vec![code.into()])) {
            tracing::warn!("reply to {command}: {e:#}");
        }
    }

    // Lookup

    pub(crate) fn local(&self, h: Handle) -> Result<&Local, DboxError> {
        self.handles.get(&h).ok_or(DboxError::InvalidParameter)
    }

    pub(crate) fn local_mut(&mut self, h: Handle) -> Result<&mut Local, DboxError> {
        self.handles.get_mut(&h).ok_or(DboxError::InvalidParameter)
    }

    pub(crate) fn common_of(&self, h: Handle) -> Result<&Common, DboxError> {
        let cid = self.local(h)?.common;
        self.commons.get(&cid).ok_or(DboxError::InvalidParameter)
    }

    pub(crate) fn common_of_mut(&mut self, h: Handle) -> Result<&mut Common, DboxError> {
        let cid = self.local(h)?.common;
        self.commons.get_mut(&cid).ok_or(DboxError::InvalidParameter)
    }

    pub(crate) fn instance(&self, cid: CommonId) -> Result<&Common, DboxError> {
        self.commons.get(&cid).ok_or(DboxError::InvalidParameter)
    }

    pub(crate) fn instance_mut(&mut self, cid: CommonId) -> Result<&mut Common, DboxError> {
        self.commons.get_mut(&cid).ok_or(DboxError::InvalidParameter)
    }

    /// The handle is active and its instance is active and named.
    pub(crate) fn validate(&self, h: Handle) -> Result<CommonId, DboxError> {
        let local = self.local(h)?;
        if local.state != HandleState::Active {
            return Err(DboxError::InvalidParameter);
        }
        let common = self
            .commons
            .get(&local.common)
            .ok_or(DboxError::InvalidParameter)?;
        if common.state != HandleState::Active || !common.is_identified() {
            return Err(DboxError::InvalidParameter);
        }
        Ok(local.common)
    }

    /// Instances not yet confirmed have no id and never match.
    pub(crate) fn find_common(&self, pkgname: &str, id: &str) -> Option<CommonId> {
        self.commons
            .iter()
            .find(|(_, c)| c.pkgname == pkgname && c.id.as_deref() == Some(id))
            .map(|(cid, _)| *cid)
    }

    pub(crate) fn find_by_timestamp(&self, timestamp: f64) -> Option<CommonId> {
        self.commons
            .iter()
            .find(|(_, c)| !c.is_identified() && c.timestamp == timestamp)
            .map(|(cid, _)| *cid)
    }

    /// An instance a new consumer may alias instead of creating its own.
    pub(crate) fn find_sharable(
        &self,
        pkgname: &str,
        content: Option<&str>,
        size: Size,
        cluster: &str,
        category: &str,
    ) -> Option<CommonId> {
        if !self.conf.sharing() {
            return None;
        }
        let content = content.unwrap_or_default();
        self.commons
            .iter()
            .find(|(_, c)| {
                matches!(c.state, HandleState::Creating | HandleState::Active)
                    && !c.deleted
                    && !c.pending.contains(Pending::SIZE_CHANGED)
                    && c.pkgname == pkgname
                    && c.cluster == cluster
                    && c.category == category
                    && c.content_str() == content
                    && c.dbox.size == size
            })
            .map(|(cid, _)| *cid)
    }

    pub(crate) fn handles_of(&self, cid: CommonId) -> Vec<Handle> {
        self.commons
            .get(&cid)
            .map(|c| c.handles.clone())
            .unwrap_or_default()
    }

    // Construction

    pub(crate) fn insert_common(&mut self, common: Common) -> CommonId {
        let cid = CommonId(self.alloc_id());
        self.commons.insert(cid, common);
        cid
    }

    pub(crate) fn insert_local(&mut self, cid: CommonId, state: HandleState) -> Handle {
        let h = Handle(self.alloc_id());
        self.handles.insert(h, Local::new(cid, state));
        if let Some(common) = self.commons.get_mut(&cid) {
            common.attach(h);
        }
        h
    }

    /// Re-point a handle at another instance.
    pub(crate) fn move_handle(&mut self, h: Handle, to: CommonId) {
        let Some(local) = self.handles.get_mut(&h) else {
            return;
        };
        let from = std::mem::replace(&mut local.common, to);
        let shown = local.visible == Visibility::Shown;
        if let Some(common) = self.commons.get_mut(&from) {
            common.detach(h);
        }
        if let Some(common) = self.commons.get_mut(&to) {
            common.attach(h);
        }
        // At most one shown handle per instance; the one that moved in wins.
        if shown {
            for sibling in self.handles_of(to) {
                if sibling == h {
                    continue;
                }
                if let Some(other) = self.handles.get_mut(&sibling) {
                    if other.visible == Visibility::Shown {
                        other.visible = Visibility::HiddenPaused;
                    }
                }
            }
        }
        self.update_visibility(from);
        self.update_visibility(to);
        self.destroy_if_unused(from);
    }

    // Reference counting

    pub fn ref_handle(&mut self, h: Handle) -> Result<usize, DboxError> {
        let local = self.local_mut(h)?;
        local.refs += 1;
        Ok(local.refs)
    }

    /// Drop a reference taken with [`Viewer::ref_handle`]. The handle is
    /// finalized when nothing references it any more.
    pub fn unref_handle(&mut self, h: Handle) -> Result<usize, DboxError> {
        self.local(h)?;
        Ok(self.unref(h))
    }

    fn unref(&mut self, h: Handle) -> usize {
        let Some(local) = self.handles.get_mut(&h) else {
            return 0;
        };
        local.refs = local.refs.saturating_sub(1);
        let refs = local.refs;
        if refs == 0 {
            self.finalize(h);
        }
        refs
    }

    /// Drop the reference the instance holds on `h`, at most once.
    pub(crate) fn release(&mut self, h: Handle) {
        let Some(local) = self.handles.get_mut(&h) else {
            return;
        };
        if !local.instance_held {
            return;
        }
        local.instance_held = false;
        self.unref(h);
    }

    /// Last reference gone: every callback still waiting gets `Fault`.
    fn finalize(&mut self, h: Handle) {
        let Some(mut local) = self.handles.remove(&h) else {
            return;
        };
        local.state = HandleState::Destroyed;
        let cid = local.common;
        if let Some(common) = self.commons.get_mut(&cid) {
            common.detach(h);
        }

        for (op, cb) in local.cbs.take_all() {
            tracing::debug!("{h}: {} abandoned", op_name(op));
            cb(self, h, Err(DboxError::Fault));
        }
        drop(local);
        tracing::debug!("{h}: destroyed");

        self.update_visibility(cid);
        self.destroy_if_unused(cid);
    }

    /// Drop an instance nobody references. One still being created is kept
    /// (marked deleting) so its creation can be undone when it completes.
    fn destroy_if_unused(&mut self, cid: CommonId) {
        let Some(common) = self.commons.get_mut(&cid) else {
            return;
        };
        if !common.handles.is_empty() {
            return;
        }
        if common.pending.contains(Pending::CREATED) {
            common.state = HandleState::Deleting;
            return;
        }

        if common.state == HandleState::Active && common.is_identified() && !common.deleted {
            let args = vec![
                common.pkgname.as_str().into(),
                common.id_str().into(),
                common.delete_type.code().into(),
            ];
            if let Err(e) = self.notify("delete", args) {
                tracing::debug!("delete unreferenced instance: {e}");
            }
        }

        if let Some(common) = self.commons.remove(&cid) {
            tracing::debug!("{} {}: instance released", common.pkgname, common.id_str());
        }
    }

    // Callback slots

    pub(crate) fn set_slot(&mut self, h: Handle, op: Op, cb: Callback) {
        if let Some(local) = self.handles.get_mut(&h) {
            *local.cbs.slot(op) = Some(cb);
        }
    }

    pub(crate) fn take_slot(&mut self, h: Handle, op: Op) -> Option<Callback> {
        self.handles.get_mut(&h)?.cbs.take(op)
    }

    // Events

    pub(crate) fn emit(&mut self, h: Handle, event: Event) {
        if self.handles.contains_key(&h) {
            registry::dispatch_event(self, h, event);
        }
    }

    pub(crate) fn emit_all(&mut self, cid: CommonId, event: Event) {
        for h in self.handles_of(cid) {
            self.emit(h, event);
        }
    }

    pub(crate) fn fault(&mut self, fault: &Fault) {
        registry::dispatch_fault(self, fault);
    }

    /// Finish a two-phase operation on every handle of the instance: a handle
    /// waiting on `op` gets its callback, the others get `event`.
    pub(crate) fn complete_op(
        &mut self,
        cid: CommonId,
        op: Op,
        event: Option<Event>,
        status: Status,
    ) {
        if let Some(common) = self.commons.get_mut(&cid) {
            common.pending.remove(op.flag());
        }
        for h in self.handles_of(cid) {
            match self.take_slot(h, op) {
                Some(cb) => cb(self, h, status),
                None => {
                    if let (Some(event), Ok(())) = (event, status) {
                        self.emit(h, event);
                    }
                }
            }
        }
    }

    // Lifecycle

    /// Tell one handle its instance is gone and drop the instance's
    /// reference on it.
    pub(crate) fn deliver_deleted(&mut self, h: Handle) {
        let Some(local) = self.handles.get_mut(&h) else {
            return;
        };
        if local.state == HandleState::Deleting && !local.instance_held {
            // Already told.
            return;
        }
        local.state = HandleState::Deleting;
        match local.cbs.take(Op::Deleted) {
            Some(cb) => cb(self, h, Ok(())),
            None => self.emit(h, Event::Deleted),
        }
        self.release(h);
    }

    /// The provider confirmed the instance is gone.
    pub(crate) fn finish_deleted(&mut self, cid: CommonId) {
        let Some(common) = self.commons.get_mut(&cid) else {
            return;
        };
        common.deleted = true;
        common.state = HandleState::Deleting;
        common.pending.remove(Pending::CREATED | Pending::DELETED);

        for h in self.handles_of(cid) {
            if let Some(cb) = self.take_slot(h, Op::Created) {
                cb(self, h, Err(DboxError::Canceled));
            }
            self.deliver_deleted(h);
        }
        self.destroy_if_unused(cid);
    }

    /// Deliver the outcome of a creation to every handle waiting on it.
    /// Handles that moved here from a resize hear about it as a size change.
    pub(crate) fn deliver_created(&mut self, cid: CommonId, status: Status) {
        for h in self.handles_of(cid) {
            let leaving = self
                .handles
                .get(&h)
                .is_some_and(|l| l.state == HandleState::Deleting);
            if let Some(cb) = self.take_slot(h, Op::Created) {
                let status = if leaving {
                    status.and(Err(DboxError::Canceled))
                } else {
                    status
                };
                cb(self, h, status);
            } else if let Some(cb) = self.take_slot(h, Op::SizeChanged) {
                cb(self, h, status);
                if status.is_ok() {
                    self.emit(h, Event::DboxSizeChanged);
                }
            } else if status.is_ok() {
                self.emit(h, Event::Created);
            }
        }
    }

    pub(crate) fn fail_creation(&mut self, cid: CommonId, err: DboxError) {
        let Some(common) = self.commons.get_mut(&cid) else {
            return;
        };
        tracing::warn!("{}: create failed: {err}", common.pkgname);
        common.pending.remove(Pending::CREATED);
        common.state = HandleState::Deleting;
        common.deleted = true;

        self.deliver_created(cid, Err(err));
        for h in self.handles_of(cid) {
            if let Ok(local) = self.local_mut(h) {
                local.state = HandleState::Deleting;
            }
            self.release(h);
        }
        self.destroy_if_unused(cid);
    }

    pub(crate) fn send_delete(&mut self, cid: CommonId) -> Status {
        let common = self.commons.get(&cid).ok_or(DboxError::InvalidParameter)?;
        let id = common.id.clone().ok_or(DboxError::InvalidParameter)?;
        let args = vec![
            common.pkgname.as_str().into(),
            id.into(),
            common.delete_type.code().into(),
        ];
        let first = common.handles.first().copied();
        self.request("delete", args, first, Route::Delete(cid))?;
        if let Some(common) = self.commons.get_mut(&cid) {
            common.pending.insert(Pending::DELETED);
        }
        Ok(())
    }

    /// Recompute the instance's visibility from its handles and report a
    /// change to the master.
    pub(crate) fn update_visibility(&mut self, cid: CommonId) {
        let Some(common) = self.commons.get(&cid) else {
            return;
        };
        let visible = Common::aggregate_visibility(
            common
                .handles
                .iter()
                .filter_map(|h| self.handles.get(h))
                .map(|l| l.visible),
        );
        if visible == common.visible {
            return;
        }

        let Some(common) = self.commons.get_mut(&cid) else {
            return;
        };
        common.visible = visible;
        if common.state != HandleState::Active || !common.is_identified() {
            return;
        }
        let args = vec![
            common.pkgname.as_str().into(),
            common.id_str().into(),
            visible.code().into(),
        ];
        if let Err(e) = self.notify("change,visibility", args) {
            tracing::debug!("visibility change not sent: {e}");
        }
    }

    // Deferred jobs

    /// Run `run` on `h` after the current call stack unwinds. The handle is
    /// kept alive until then.
    pub(crate) fn job_add(
        &mut self,
        h: Handle,
        run: impl FnOnce(&mut Viewer, Handle) + 'static,
    ) -> Status {
        self.ref_handle(h)?;
        self.jobs.push_back(Job {
            handle: h,
            run: Box::new(run),
        });
        Ok(())
    }

    /// Run the jobs queued so far. Jobs they queue wait for the next call.
    pub fn run_jobs(&mut self) -> usize {
        let count = self.jobs.len();
        for _ in 0..count {
            let Some(job) = self.jobs.pop_front() else {
                break;
            };
            (job.run)(self, job.handle);
            self.unref(job.handle);
        }
        count
    }

    pub fn has_jobs(&self) -> bool {
        !self.jobs.is_empty()
    }

    /// The master went away. In-flight requests are abandoned without a
    /// callback; every live handle is torn down.
    pub fn disconnected(&mut self) {
        tracing::warn!(
            "master disconnected, {} request(s) abandoned",
            self.replies.len()
        );
        self.replies.clear();
        self.transport = None;
        self.fault(&Fault::disconnected());

        let cids: Vec<CommonId> = self.commons.keys().copied().collect();
        for cid in cids {
            let Some(common) = self.commons.get_mut(&cid) else {
                continue;
            };
            common.pending = Pending::empty();
            common.state = HandleState::Deleting;
            common.deleted = true;

            for h in self.handles_of(cid) {
                let Some(local) = self.handles.get_mut(&h) else {
                    continue;
                };
                local.state = HandleState::Deleting;
                for (_, cb) in local.cbs.take_all() {
                    cb(self, h, Err(DboxError::Fault));
                }
                self.emit(h, Event::Deleted);
                self.release(h);
            }
            self.destroy_if_unused(cid);
        }
    }

    /// Handle one packet from the master.
    pub fn dispatch(&mut self, packet: Packet) {
        match packet.kind {
            PacketKind::Reply => self.on_reply(packet),
            PacketKind::Request => {
                let status = self.on_command(&packet);
                self.send_reply(packet.seq, &packet.command, status);
            }
            PacketKind::Notify => {
                if let Err(e) = self.on_command(&packet) {
                    tracing::debug!("{}: {e}", packet.command);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use super::*;
    use crate::buffer::{Buffer, BufferKind};
    use crate::types::{Rect, SizeType};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    pub(crate) type Sent = Rc<RefCell<Vec<Packet>>>;

    struct Recorder(Sent);

    impl Transport for Recorder {
        fn send(&mut self, packet: Packet) -> anyhow::Result<()> {
            self.0.borrow_mut().push(packet);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FakeBuffer {
        identity: String,
        size: Size,
        syncs: Rc<Cell<usize>>,
    }

    impl Buffer for FakeBuffer {
        fn identity(&self) -> &str {
            &self.identity
        }
        fn kind(&self) -> BufferKind {
            BufferKind::Pixmap
        }
        fn size(&self) -> Size {
            self.size
        }
        fn sync(&mut self, _damage: Rect) -> Status {
            self.syncs.set(self.syncs.get() + 1);
            Ok(())
        }
        fn pixels(&self) -> &[u8] {
            &[1, 2, 3, 4]
        }
        fn resource_id(&self) -> Option<u32> {
            self.identity.strip_prefix("pixmap://")?.parse().ok()
        }
    }

    /// Counts buffer creations and syncs.
    #[derive(Clone, Default)]
    pub(crate) struct Counters {
        pub(crate) created: Rc<Cell<usize>>,
        pub(crate) syncs: Rc<Cell<usize>>,
    }

    struct CountingBackend(Counters);

    impl BufferBackend for CountingBackend {
        fn create(&mut self, identity: &str, size: Size) -> Option<Box<dyn Buffer>> {
            self.0.created.set(self.0.created.get() + 1);
            Some(Box::new(FakeBuffer {
                identity: identity.to_string(),
                size,
                syncs: self.0.syncs.clone(),
            }))
        }
    }

    pub(crate) fn viewer_with(conf: Config) -> (Viewer, Sent, Counters) {
        let counters = Counters::default();
        let mut v = Viewer::new(conf, Box::new(CountingBackend(counters.clone())));
        let sent = Sent::default();
        v.attach(Box::new(Recorder(sent.clone())));
        (v, sent, counters)
    }

    pub(crate) fn viewer() -> (Viewer, Sent) {
        let (v, sent, _) = viewer_with(Config::default());
        (v, sent)
    }

    pub(crate) fn last(sent: &Sent) -> Packet {
        sent.borrow().last().cloned().expect("nothing sent")
    }

    pub(crate) fn commands(sent: &Sent) -> Vec<String> {
        sent.borrow().iter().map(|p| p.command.clone()).collect()
    }

    pub(crate) fn reply(request: &Packet, status: Status) -> Packet {
        let code = crate::status::status_code(status);
        Packet::reply(request.seq, &request.command, vec![code.into()])
    }

    pub(crate) fn notify(command: &str, args: Vec<Value>) -> Packet {
        Packet::notify(command, args)
    }

    /// The "created" notification answering a "new" request.
    pub(crate) fn created(new: &Packet, id: &str, status: Status) -> Packet {
        let mut r = new.reader();
        let pkgname = r.str().unwrap().to_string();
        let content = r.str().unwrap().to_string();
        let cluster = r.str().unwrap().to_string();
        let category = r.str().unwrap().to_string();
        let ts = r.double().unwrap();
        let period = r.double().unwrap();
        let w = r.int().unwrap();
        let h = r.int().unwrap();
        notify(
            "created",
            vec![
                ts.into(),
                pkgname.into(),
                id.into(),
                content.into(),
                w.into(),
                h.into(),
                0i32.into(),
                0i32.into(),
                cluster.into(),
                category.into(),
                format!("pixmap://{}", 100 + w).into(),
                "".into(),
                "".into(),
                0.5.into(),
                1i32.into(),
                1i32.into(),
                2i32.into(),
                2i32.into(),
                period.into(),
                "".into(),
                0i32.into(),
                crate::status::status_code(status).into(),
            ],
        )
    }

    /// Add an instance and confirm its creation.
    pub(crate) fn active(v: &mut Viewer, sent: &Sent, pkgname: &str, id: &str) -> Handle {
        let h = v
            .add(pkgname, None, "home", "default", 3600.0, SizeType::S1x1, None)
            .unwrap();
        let new = last(sent);
        assert_eq!(new.command, "new");
        v.dispatch(created(&new, id, Ok(())));
        v.run_jobs();
        h
    }
}

#[cfg(test)]
mod tests {
    use super::fixture::*;
    use super::*;
    use crate::callback::callback;
    use std::cell::RefCell;
    use std::ops::ControlFlow;
    use std::rc::Rc;

    #[test]
    fn test_timestamps_strictly_increase() {
        let (mut v, _sent) = viewer();
        let a = v.timestamp();
        let b = v.timestamp();
        let c = v.timestamp();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_job_keeps_handle_alive() {
        let (mut v, sent) = viewer();
        let h = active(&mut v, &sent, "weather", "w1");
        let ran = Rc::new(RefCell::new(false));
        let r = ran.clone();
        v.job_add(h, move |v, h| {
            // Released by the instance but still referenced by this job.
            assert!(v.local(h).is_ok());
            *r.borrow_mut() = true;
        })
        .unwrap();
        v.release(h);
        assert!(v.local(h).is_ok());
        assert_eq!(v.run_jobs(), 1);
        assert!(*ran.borrow());
        assert_eq!(v.state(h), HandleState::Destroyed);
    }

    #[test]
    fn test_jobs_queued_by_jobs_wait() {
        let (mut v, sent) = viewer();
        let h = active(&mut v, &sent, "weather", "w1");
        v.job_add(h, |v, h| {
            v.job_add(h, |_, _| {}).unwrap();
        })
        .unwrap();
        assert_eq!(v.run_jobs(), 1);
        assert!(v.has_jobs());
        assert_eq!(v.run_jobs(), 1);
        assert!(!v.has_jobs());
    }

    // Property: a handle reaching zero references faults its pending slots.
    #[test]
    fn test_finalize_faults_pending_slots() {
        let (mut v, sent) = viewer();
        let h = active(&mut v, &sent, "weather", "w1");
        let got = Rc::new(RefCell::new(None));
        let g = got.clone();
        v.set_period(
            h,
            30.0,
            callback(move |_, _, status| *g.borrow_mut() = Some(status)),
        )
        .unwrap();
        v.release(h);
        assert_eq!(*got.borrow(), Some(Err(DboxError::Fault)));
        assert_eq!(v.state(h), HandleState::Destroyed);
    }

    // Scenario: disconnect with three handles over two instances.
    #[test]
    fn test_disconnect_tears_down_everything() {
        let (mut v, sent) = viewer();
        let a = active(&mut v, &sent, "weather", "w1");
        let b = v
            .add("weather", None, "home", "default", 3600.0, crate::types::SizeType::S1x1, None)
            .unwrap();
        v.run_jobs();
        let c = active(&mut v, &sent, "clock", "c1");
        assert_eq!(v.refcount(a), Ok(2));

        let faults = Rc::new(RefCell::new(Vec::new()));
        let f = faults.clone();
        v.add_fault_handler(move |_, fault| {
            f.borrow_mut().push(fault.kind);
            ControlFlow::Continue(())
        });
        let deleted = Rc::new(RefCell::new(Vec::new()));
        let d = deleted.clone();
        v.add_event_handler(move |_, h, ev| {
            if ev == Event::Deleted {
                d.borrow_mut().push(h);
            }
            ControlFlow::Continue(())
        });

        // A request still in flight is abandoned, not resolved.
        let resolved = Rc::new(RefCell::new(Vec::new()));
        let r = resolved.clone();
        v.set_group(
            c,
            "lock",
            "clock",
            callback(move |_, _, status| r.borrow_mut().push(status)),
        )
        .unwrap();

        v.disconnected();

        assert_eq!(*faults.borrow(), vec![crate::types::FaultKind::ProviderDisconnected]);
        let mut seen = deleted.borrow().clone();
        seen.sort();
        assert_eq!(seen, vec![a, b, c]);
        assert!(resolved.borrow().iter().all(|s| s.is_err()));
        for h in [a, b, c] {
            assert_eq!(v.state(h), HandleState::Destroyed);
        }
        assert!(!v.is_connected());
        assert!(v.commons.is_empty());
    }

    #[test]
    fn test_request_without_transport_is_fault() {
        let mut v = Viewer::new(Config::default(), Box::new(crate::buffer::SystemBackend::new()));
        assert_eq!(
            v.add("weather", None, "home", "default", 1.0, crate::types::SizeType::S1x1, None),
            Err(DboxError::Fault)
        );
        assert!(v.commons.is_empty());
        assert!(v.handles.is_empty());
    }

    #[test]
    fn test_master_request_gets_status_reply() {
        let (mut v, sent) = viewer();
        let _h = active(&mut v, &sent, "weather", "w1");
        let mut req = Packet::request("scroll", vec!["weather".into(), "nope".into(), 1i32.into()]);
        req.seq = 44;
        v.dispatch(req);
        let answer = last(&sent);
        assert_eq!(answer.kind, PacketKind::Reply);
        assert_eq!(answer.seq, 44);
        assert_eq!(answer.args, vec![Value::Int(DboxError::NotExist.code())]);
    }
}
