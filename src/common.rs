//! Provider-synchronized state of one instance, shared by every handle that
//! aliases it.

use crate::buffer::{Buffer, BufferBackend, ReadLock};
use crate::conf::Config;
use crate::status::{DboxError, Status};
use crate::types::{
    BufferType, DeleteType, Handle, HandleState, Pending, Rect, Size, SizeType, Target, Visibility,
};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct CommonId(pub(crate) u64);

/// One buffer-bearing region.
#[derive(Debug, Default)]
pub(crate) struct Surface {
    pub(crate) kind: BufferType,
    pub(crate) buffer: Option<Box<dyn Buffer>>,
    pub(crate) size: Size,
    pub(crate) last_damage: Rect,
    /// Extra buffer resource ids; allocated on first use
    pub(crate) extra: Option<Vec<u32>>,
    pub(crate) last_extra: Option<usize>,
    pub(crate) lock: Option<ReadLock>,
}

impl Surface {
    fn identity(&self) -> Option<&str> {
        self.buffer.as_ref().map(|b| b.identity())
    }
}

#[derive(Debug)]
pub(crate) struct Common {
    pub(crate) pkgname: String,
    pub(crate) id: Option<String>,
    pub(crate) timestamp: f64,
    pub(crate) state: HandleState,
    /// The provider confirmed deletion
    pub(crate) deleted: bool,
    /// Kind of the delete requested before the id was known
    pub(crate) delete_type: DeleteType,

    pub(crate) cluster: String,
    pub(crate) category: String,
    pub(crate) content: Option<String>,
    pub(crate) title: Option<String>,
    pub(crate) alt_icon: Option<String>,
    pub(crate) alt_name: Option<String>,
    pub(crate) auto_launch: Option<String>,
    pub(crate) priority: f64,
    pub(crate) period: f64,

    pub(crate) is_user: bool,
    pub(crate) pinup_supported: bool,
    pub(crate) is_pinned_up: bool,
    pub(crate) is_active_update: bool,
    pub(crate) mouse_event: bool,
    pub(crate) hold_scroll: bool,

    pub(crate) dbox: Surface,
    pub(crate) gbar: Surface,
    pub(crate) gbar_default_size: Size,
    pub(crate) gbar_pos: (f64, f64),
    pub(crate) gbar_created: bool,

    pub(crate) pending: Pending,
    pub(crate) handles: Vec<Handle>,
    pub(crate) visible: Visibility,
}

impl Common {
    pub(crate) fn new(
        pkgname: &str,
        content: Option<&str>,
        cluster: &str,
        category: &str,
        timestamp: f64,
    ) -> Self {
        Self {
            pkgname: pkgname.to_string(),
            id: None,
            timestamp,
            state: HandleState::Creating,
            deleted: false,
            delete_type: DeleteType::Permanently,
            cluster: cluster.to_string(),
            category: category.to_string(),
            content: content.filter(|c| !c.is_empty()).map(str::to_string),
            title: None,
            alt_icon: None,
            alt_name: None,
            auto_launch: None,
            priority: 0.0,
            period: -1.0,
            is_user: true,
            pinup_supported: false,
            is_pinned_up: false,
            is_active_update: false,
            mouse_event: false,
            hold_scroll: false,
            dbox: Surface::default(),
            gbar: Surface::default(),
            gbar_default_size: Size::default(),
            gbar_pos: (0.0, 0.0),
            gbar_created: false,
            pending: Pending::empty(),
            handles: Vec::new(),
            visible: Visibility::Hidden,
        }
    }

    /// Number of local handles aliasing this instance.
    pub(crate) fn refcnt(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn is_identified(&self) -> bool {
        self.id.is_some()
    }

    pub(crate) fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    pub(crate) fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    pub(crate) fn surface(&self, target: Target) -> &Surface {
        match target {
            Target::Dbox => &self.dbox,
            Target::Gbar => &self.gbar,
        }
    }

    pub(crate) fn surface_mut(&mut self, target: Target) -> &mut Surface {
        match target {
            Target::Dbox => &mut self.dbox,
            Target::Gbar => &mut self.gbar,
        }
    }

    pub(crate) fn attach(&mut self, handle: Handle) {
        if !self.handles.contains(&handle) {
            self.handles.push(handle);
        }
    }

    pub(crate) fn detach(&mut self, handle: Handle) {
        self.handles.retain(|h| *h != handle);
    }

    // Mutators. Each one builds the new value completely before it touches
    // the old one.

    pub(crate) fn set_id(&mut self, id: Option<&str>) {
        self.id = id.filter(|s| !s.is_empty()).map(str::to_string);
    }

    pub(crate) fn set_group(&mut self, cluster: &str, category: &str) -> Status {
        if cluster.is_empty() || category.is_empty() {
            return Err(DboxError::InvalidParameter);
        }
        let cluster = cluster.to_string();
        let category = category.to_string();
        self.cluster = cluster;
        self.category = category;
        Ok(())
    }

    pub(crate) fn set_content(&mut self, content: Option<&str>) {
        self.content = content.filter(|c| !c.is_empty()).map(str::to_string);
    }

    pub(crate) fn set_title(&mut self, title: Option<&str>) {
        self.title = title.map(str::to_string);
    }

    pub(crate) fn set_alt_info(&mut self, icon: Option<&str>, name: Option<&str>) {
        self.alt_icon = icon.filter(|s| !s.is_empty()).map(str::to_string);
        self.alt_name = name.filter(|s| !s.is_empty()).map(str::to_string);
    }

    pub(crate) fn set_auto_launch(&mut self, auto_launch: Option<&str>) {
        self.auto_launch = auto_launch.filter(|s| !s.is_empty()).map(str::to_string);
    }

    /// Also re-derives whether the instance takes mouse move events, which
    /// depends on the size class.
    pub(crate) fn set_size(&mut self, size: Size, conf: &Config) {
        self.dbox.size = size;
        self.mouse_event = conf.mouse_event(&self.pkgname, SizeType::from_size(size));
    }

    pub(crate) fn set_gbar_size(&mut self, size: Size) {
        self.gbar.size = size;
    }

    pub(crate) fn set_default_gbar_size(&mut self, size: Size) {
        self.gbar_default_size = size;
    }

    pub(crate) fn set_damage(&mut self, target: Target, rect: Rect) {
        self.surface_mut(target).last_damage = rect;
    }

    /// Attach the buffer named by `identity` to a surface.
    ///
    /// An unchanged identity is success on the primary surface and `Exist`
    /// on the detail surface. The old buffer is released only once the new
    /// one exists, and also when creating the new one fails.
    pub(crate) fn set_buffer(
        &mut self,
        target: Target,
        identity: Option<&str>,
        backend: &mut dyn BufferBackend,
    ) -> Status {
        let surface = self.surface_mut(target);
        let Some(identity) = identity.filter(|s| !s.is_empty()) else {
            surface.buffer = None;
            return Ok(());
        };

        if surface.identity() == Some(identity) {
            return match target {
                Target::Dbox => Ok(()),
                Target::Gbar => Err(DboxError::Exist),
            };
        }

        let created = backend.create(identity, surface.size);
        let failed = created.is_none();
        surface.buffer = created;
        if failed {
            tracing::error!("{}: failed to create buffer {identity}", self.pkgname);
            return Err(DboxError::Fault);
        }
        Ok(())
    }

    /// Open the advisory lock for a surface whose buffer lives in a file or
    /// shm segment. Missing lock files just mean the provider does not lock.
    pub(crate) fn open_lock(&mut self, target: Target, lock_dir: &Path) {
        let Some(id) = self.id.clone() else {
            return;
        };
        let needs_lock = self
            .surface(target)
            .buffer
            .as_ref()
            .is_some_and(|b| b.kind().needs_lock());
        let surface = self.surface_mut(target);
        if !needs_lock {
            surface.lock = None;
            return;
        }
        if surface.lock.is_some() {
            return;
        }
        match ReadLock::open(lock_dir, &id, target) {
            Ok(lock) => surface.lock = Some(lock),
            Err(e) => tracing::debug!("{id}: no {} lock: {e}", target.prefix()),
        }
    }

    /// Copy the last damaged region out of the shared buffer.
    pub(crate) fn sync(&mut self, target: Target) -> Status {
        let Surface {
            buffer,
            lock,
            last_damage,
            ..
        } = self.surface_mut(target);
        let buffer = buffer.as_mut().ok_or(DboxError::InvalidParameter)?;

        if !buffer.kind().needs_lock() {
            return buffer.sync(*last_damage);
        }

        let _guard = match lock {
            Some(lock) => Some(lock.acquire().map_err(|e| {
                tracing::warn!("lock {}: {e}", lock.path().display());
                DboxError::Fault
            })?),
            None => None,
        };
        buffer.sync(*last_damage)
    }

    fn check_extra(idx: usize, count: usize) -> Status {
        if idx >= count {
            return Err(DboxError::InvalidParameter);
        }
        Ok(())
    }

    fn extra_slots(&mut self, target: Target, count: usize) -> &mut Vec<u32> {
        let extra = self
            .surface_mut(target)
            .extra
            .get_or_insert_with(|| vec![0; count]);
        if extra.len() < count {
            extra.resize(count, 0);
        }
        extra
    }

    pub(crate) fn set_extra_buffer(
        &mut self,
        target: Target,
        idx: usize,
        resource: u32,
        count: usize,
    ) -> Status {
        Self::check_extra(idx, count)?;
        self.extra_slots(target, count)[idx] = resource;
        self.surface_mut(target).last_extra = Some(idx);
        Ok(())
    }

    pub(crate) fn clear_extra_buffer(
        &mut self,
        target: Target,
        idx: usize,
        count: usize,
    ) -> Status {
        Self::check_extra(idx, count)?;
        self.extra_slots(target, count)[idx] = 0;
        let surface = self.surface_mut(target);
        if surface.last_extra == Some(idx) {
            surface.last_extra = None;
        }
        Ok(())
    }

    pub(crate) fn touch_extra_buffer(
        &mut self,
        target: Target,
        idx: usize,
        count: usize,
    ) -> Status {
        Self::check_extra(idx, count)?;
        self.surface_mut(target).last_extra = Some(idx);
        Ok(())
    }

    pub(crate) fn extra_buffer(
        &self,
        target: Target,
        idx: usize,
        count: usize,
    ) -> Result<u32, DboxError> {
        Self::check_extra(idx, count)?;
        match self.surface(target).extra.as_ref().and_then(|e| e.get(idx)) {
            Some(&rid) if rid != 0 => Ok(rid),
            _ => Err(DboxError::NotExist),
        }
    }

    /// Derived from the handles' own states: shown wins, then paused.
    pub(crate) fn aggregate_visibility(states: impl Iterator<Item = Visibility>) -> Visibility {
        let mut agg = Visibility::Hidden;
        for state in states {
            match state {
                Visibility::Shown => return Visibility::Shown,
                Visibility::HiddenPaused => agg = Visibility::HiddenPaused,
                _ => {}
            }
        }
        agg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferKind;
    use std::cell::Cell;
    use std::rc::Rc;

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
            &[]
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        created: usize,
        fail: bool,
        syncs: Rc<Cell<usize>>,
    }

    impl BufferBackend for FakeBackend {
        fn create(&mut self, identity: &str, size: Size) -> Option<Box<dyn Buffer>> {
            self.created += 1;
            if self.fail {
                return None;
            }
            Some(Box::new(FakeBuffer {
                identity: identity.to_string(),
                size,
                syncs: self.syncs.clone(),
            }))
        }
    }

    fn common() -> Common {
        Common::new("weather", None, "home", "default", 1.0)
    }

    #[test]
    fn test_same_identity_is_noop_on_primary() {
        let mut c = common();
        let mut backend = FakeBackend::default();
        c.set_buffer(Target::Dbox, Some("pixmap://1"), &mut backend).unwrap();
        c.set_buffer(Target::Dbox, Some("pixmap://1"), &mut backend).unwrap();
        assert_eq!(backend.created, 1);
    }

    #[test]
    fn test_same_identity_is_exist_on_detail() {
        let mut c = common();
        let mut backend = FakeBackend::default();
        c.set_buffer(Target::Gbar, Some("pixmap://2"), &mut backend).unwrap();
        assert_eq!(
            c.set_buffer(Target::Gbar, Some("pixmap://2"), &mut backend),
            Err(DboxError::Exist)
        );
        assert_eq!(backend.created, 1);
    }

    #[test]
    fn test_failed_create_releases_old_buffer() {
        let mut c = common();
        let mut backend = FakeBackend::default();
        c.set_buffer(Target::Dbox, Some("pixmap://1"), &mut backend).unwrap();
        backend.fail = true;
        assert_eq!(
            c.set_buffer(Target::Dbox, Some("pixmap://9"), &mut backend),
            Err(DboxError::Fault)
        );
        assert!(c.dbox.buffer.is_none());
    }

    #[test]
    fn test_empty_identity_clears() {
        let mut c = common();
        let mut backend = FakeBackend::default();
        c.set_buffer(Target::Dbox, Some("pixmap://1"), &mut backend).unwrap();
        c.set_buffer(Target::Dbox, Some(""), &mut backend).unwrap();
        assert!(c.dbox.buffer.is_none());
        assert_eq!(c.sync(Target::Dbox), Err(DboxError::InvalidParameter));
    }

    #[test]
    fn test_sync_pixmap_without_lock() {
        let mut c = common();
        let mut backend = FakeBackend::default();
        c.set_buffer(Target::Dbox, Some("pixmap://1"), &mut backend).unwrap();
        c.set_damage(Target::Dbox, Rect::new(0, 0, 10, 10));
        c.sync(Target::Dbox).unwrap();
        assert_eq!(backend.syncs.get(), 1);
    }

    #[test]
    fn test_set_group_rejects_empty() {
        let mut c = common();
        assert_eq!(c.set_group("", "x"), Err(DboxError::InvalidParameter));
        assert_eq!(c.cluster, "home");
        c.set_group("lock", "clock").unwrap();
        assert_eq!((c.cluster.as_str(), c.category.as_str()), ("lock", "clock"));
    }

    #[test]
    fn test_set_size_derives_mouse_event() {
        let conf = Config {
            mouse_event: vec!["weather:2x2".into()],
            ..Config::default()
        };
        let mut c = common();
        c.set_size(SizeType::S2x2.size(), &conf);
        assert!(c.mouse_event);
        c.set_size(SizeType::S1x1.size(), &conf);
        assert!(!c.mouse_event);
    }

    #[test]
    fn test_extra_buffer_index_checked() {
        let mut c = common();
        assert_eq!(
            c.set_extra_buffer(Target::Dbox, 0, 5, 0),
            Err(DboxError::InvalidParameter)
        );
        c.set_extra_buffer(Target::Dbox, 1, 42, 2).unwrap();
        assert_eq!(c.dbox.last_extra, Some(1));
        assert_eq!(c.extra_buffer(Target::Dbox, 1, 2), Ok(42));
        assert_eq!(c.extra_buffer(Target::Dbox, 0, 2), Err(DboxError::NotExist));
        assert_eq!(
            c.extra_buffer(Target::Dbox, 2, 2),
            Err(DboxError::InvalidParameter)
        );
        c.clear_extra_buffer(Target::Dbox, 1, 2).unwrap();
        assert_eq!(c.dbox.last_extra, None);
    }

    #[test]
    fn test_aggregate_visibility() {
        use Visibility::*;
        assert_eq!(Common::aggregate_visibility([Hidden, HiddenPaused].into_iter()), HiddenPaused);
        assert_eq!(Common::aggregate_visibility([HiddenPaused, Shown].into_iter()), Shown);
        assert_eq!(Common::aggregate_visibility(std::iter::empty()), Hidden);
    }
}
