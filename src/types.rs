//! Value types shared across the viewer.

use std::fmt;

/// Opaque reference to one consumer's view of an instance.
///
/// Ids are never reused, so a handle that outlived its instance simply stops
/// resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub(crate) u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h#{}", self.0)
    }
}

/// Lifecycle of both Common and Local handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Creating,
    Active,
    Deleting,
    Destroyed,
}

/// Which buffer-bearing region of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// Primary surface (the box itself)
    Dbox,
    /// Detail surface (glance bar)
    Gbar,
}

impl Target {
    pub fn is_gbar(self) -> bool {
        matches!(self, Target::Gbar)
    }

    pub fn from_flag(is_gbar: bool) -> Self {
        if is_gbar {
            Target::Gbar
        } else {
            Target::Dbox
        }
    }

    pub(crate) fn prefix(self) -> &'static str {
        match self {
            Target::Dbox => "dbox",
            Target::Gbar => "gbar",
        }
    }
}

/// How the provider delivers content for a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferType {
    #[default]
    None,
    Script,
    Buffer,
    Text,
    Native,
}

impl BufferType {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => BufferType::Script,
            2 => BufferType::Buffer,
            3 => BufferType::Text,
            4 => BufferType::Native,
            _ => BufferType::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    Shown,
    HiddenPaused,
    #[default]
    Hidden,
    Error,
}

impl Visibility {
    pub(crate) fn code(self) -> i32 {
        match self {
            Visibility::Shown => 1,
            Visibility::HiddenPaused => 2,
            Visibility::Hidden => 3,
            Visibility::Error => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeleteType {
    Permanently,
    Temporary,
}

impl DeleteType {
    pub(crate) fn code(self) -> i32 {
        match self {
            DeleteType::Permanently => 1,
            DeleteType::Temporary => 2,
        }
    }
}

/// Size classes understood by providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeType {
    S1x1,
    S2x1,
    S2x2,
    S4x1,
    S4x2,
    S4x3,
    S4x4,
    S4x5,
    S4x6,
    Easy1x1,
    Easy3x1,
    Easy3x3,
    S0x0,
}

const SIZE_TABLE: [(SizeType, &str, u32, u32); 13] = [
    (SizeType::S1x1, "1x1", 175, 175),
    (SizeType::S2x1, "2x1", 354, 175),
    (SizeType::S2x2, "2x2", 354, 354),
    (SizeType::S4x1, "4x1", 712, 175),
    (SizeType::S4x2, "4x2", 712, 354),
    (SizeType::S4x3, "4x3", 712, 533),
    (SizeType::S4x4, "4x4", 712, 712),
    (SizeType::S4x5, "4x5", 712, 891),
    (SizeType::S4x6, "4x6", 712, 1070),
    (SizeType::Easy1x1, "easy1x1", 224, 215),
    (SizeType::Easy3x1, "easy3x1", 680, 215),
    (SizeType::Easy3x3, "easy3x3", 680, 653),
    (SizeType::S0x0, "0x0", 720, 1280),
];

impl SizeType {
    /// Pixel size of this class.
    pub fn size(self) -> Size {
        let (_, _, w, h) = SIZE_TABLE
            .iter()
            .copied()
            .find(|(t, ..)| *t == self)
            .unwrap_or(SIZE_TABLE[0]);
        Size::new(w, h)
    }

    /// Reverse lookup; `None` for sizes no class produces.
    pub fn from_size(size: Size) -> Option<Self> {
        SIZE_TABLE
            .iter()
            .find(|(_, _, w, h)| *w == size.width && *h == size.height)
            .map(|(t, ..)| *t)
    }

    pub fn name(self) -> &'static str {
        SIZE_TABLE
            .iter()
            .find(|(t, ..)| *t == self)
            .map(|(_, n, ..)| *n)
            .unwrap_or("1x1")
    }

    pub fn parse(name: &str) -> Option<Self> {
        SIZE_TABLE
            .iter()
            .find(|(_, n, ..)| n.eq_ignore_ascii_case(name))
            .map(|(t, ..)| *t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Damaged region reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }
}

/// Events fanned out to global observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    DboxUpdated,
    GbarUpdated,
    Created,
    Deleted,
    GroupChanged,
    PinupChanged,
    PeriodChanged,
    DboxSizeChanged,
    GbarSizeChanged,
    GbarCreated,
    GbarDestroyed,
    HoldScroll,
    ReleaseScroll,
    DboxUpdateBegin,
    DboxUpdateEnd,
    GbarUpdateBegin,
    GbarUpdateEnd,
    UpdateModeChanged,
    RequestCloseGbar,
    ExtraInfoUpdated,
    DboxExtraUpdated,
    GbarExtraUpdated,
    DboxExtraBufferCreated,
    DboxExtraBufferDestroyed,
    GbarExtraBufferCreated,
    GbarExtraBufferDestroyed,
}

impl Event {
    pub(crate) fn updated(target: Target) -> Self {
        match target {
            Target::Dbox => Event::DboxUpdated,
            Target::Gbar => Event::GbarUpdated,
        }
    }

    pub(crate) fn update_begin(target: Target) -> Self {
        match target {
            Target::Dbox => Event::DboxUpdateBegin,
            Target::Gbar => Event::GbarUpdateBegin,
        }
    }

    pub(crate) fn update_end(target: Target) -> Self {
        match target {
            Target::Dbox => Event::DboxUpdateEnd,
            Target::Gbar => Event::GbarUpdateEnd,
        }
    }

    pub(crate) fn extra_updated(target: Target) -> Self {
        match target {
            Target::Dbox => Event::DboxExtraUpdated,
            Target::Gbar => Event::GbarExtraUpdated,
        }
    }

    pub(crate) fn extra_created(target: Target) -> Self {
        match target {
            Target::Dbox => Event::DboxExtraBufferCreated,
            Target::Gbar => Event::GbarExtraBufferCreated,
        }
    }

    pub(crate) fn extra_destroyed(target: Target) -> Self {
        match target {
            Target::Dbox => Event::DboxExtraBufferDestroyed,
            Target::Gbar => Event::GbarExtraBufferDestroyed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The provider deactivated a package after it misbehaved
    Deactivated,
    ProviderDisconnected,
}

/// Payload of a fault dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub kind: FaultKind,
    pub pkgname: Option<String>,
    pub id: Option<String>,
    pub func: Option<String>,
}

impl Fault {
    pub(crate) fn disconnected() -> Self {
        Self {
            kind: FaultKind::ProviderDisconnected,
            pkgname: None,
            id: None,
            func: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseEvent {
    Down,
    Up,
    Move,
    Enter,
    Leave,
}

impl MouseEvent {
    pub(crate) fn name(self) -> &'static str {
        match self {
            MouseEvent::Down => "mouse_down",
            MouseEvent::Up => "mouse_up",
            MouseEvent::Move => "mouse_move",
            MouseEvent::Enter => "mouse_enter",
            MouseEvent::Leave => "mouse_leave",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessEvent {
    Highlight,
    HighlightNext,
    HighlightPrev,
    Unhighlight,
    Activate,
    Action,
    Scroll,
    ValueChange,
}

impl AccessEvent {
    pub(crate) fn name(self) -> &'static str {
        match self {
            AccessEvent::Highlight => "access_hl",
            AccessEvent::HighlightNext => "access_hl_next",
            AccessEvent::HighlightPrev => "access_hl_prev",
            AccessEvent::Unhighlight => "access_unhighlight",
            AccessEvent::Activate => "access_activate",
            AccessEvent::Action => "access_action",
            AccessEvent::Scroll => "access_scroll",
            AccessEvent::ValueChange => "access_value_change",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    Down,
    Up,
    FocusIn,
    FocusOut,
}

impl KeyEvent {
    pub(crate) fn name(self) -> &'static str {
        match self {
            KeyEvent::Down => "key_down",
            KeyEvent::Up => "key_up",
            KeyEvent::FocusIn => "key_focus_in",
            KeyEvent::FocusOut => "key_focus_out",
        }
    }
}

/// Asynchronous operation kinds; each owns one pending flag and one
/// callback slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Created,
    Deleted,
    Pinup,
    GroupChanged,
    PeriodChanged,
    SizeChanged,
    GbarCreated,
    GbarDestroyed,
    UpdateMode,
    AccessEvent,
    KeyEvent,
}

impl Op {
    pub const ALL: [Op; 11] = [
        Op::Created,
        Op::Deleted,
        Op::Pinup,
        Op::GroupChanged,
        Op::PeriodChanged,
        Op::SizeChanged,
        Op::GbarCreated,
        Op::GbarDestroyed,
        Op::UpdateMode,
        Op::AccessEvent,
        Op::KeyEvent,
    ];

    pub fn flag(self) -> Pending {
        match self {
            Op::Created => Pending::CREATED,
            Op::Deleted => Pending::DELETED,
            Op::Pinup => Pending::PINUP,
            Op::GroupChanged => Pending::GROUP_CHANGED,
            Op::PeriodChanged => Pending::PERIOD_CHANGED,
            Op::SizeChanged => Pending::SIZE_CHANGED,
            Op::GbarCreated => Pending::GBAR_CREATED,
            Op::GbarDestroyed => Pending::GBAR_DESTROYED,
            Op::UpdateMode => Pending::UPDATE_MODE,
            Op::AccessEvent => Pending::ACCESS_EVENT,
            Op::KeyEvent => Pending::KEY_EVENT,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

bitflags::bitflags! {
    /// Requests in flight on one instance; at most one per kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Pending: u16 {
        const CREATED = 1 << 0;
        const DELETED = 1 << 1;
        const PINUP = 1 << 2;
        const GROUP_CHANGED = 1 << 3;
        const PERIOD_CHANGED = 1 << 4;
        const SIZE_CHANGED = 1 << 5;
        const GBAR_CREATED = 1 << 6;
        const GBAR_DESTROYED = 1 << 7;
        const UPDATE_MODE = 1 << 8;
        const ACCESS_EVENT = 1 << 9;
        const KEY_EVENT = 1 << 10;
    }
}
