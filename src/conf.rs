//! Viewer configuration.
//!
//! Everything here is read-only to the core except the extra buffer count,
//! which the session learns from the handshake reply.

use crate::types::SizeType;
use clap::ArgAction;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SOCKET: &str = "/tmp/.dbox.service/service.client";
pub const DEFAULT_LOCK_DIR: &str = "/tmp/.dbox.service";
pub const DEFAULT_EVENT_FILTER: f64 = 0.01;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;

#[derive(Debug, Clone, clap::Args)]
pub struct Config {
    /// Master socket path
    #[arg(long, default_value = DEFAULT_SOCKET)]
    pub socket: PathBuf,

    /// Path of the direct update socket (defaults to one derived from the pid)
    #[arg(long)]
    pub direct_path: Option<PathBuf>,

    /// Directory holding buffer lock files
    #[arg(long, default_value = DEFAULT_LOCK_DIR)]
    pub lock_dir: PathBuf,

    /// Drop primary updates while a resize is in flight
    #[arg(long)]
    pub frame_drop: bool,

    /// Never sync buffers on update; callers sync explicitly
    #[arg(long)]
    pub manual_sync: bool,

    /// Disable instance sharing between consumers
    #[arg(long = "no-sharing", action = ArgAction::SetFalse)]
    pub sharing: bool,

    /// Accept updates on a direct socket from providers
    #[arg(long)]
    pub direct_update: bool,

    #[arg(skip)]
    pub extra_buffer_count: usize,

    /// Mouse move filter as a fraction of the instance width
    #[arg(long, default_value_t = DEFAULT_EVENT_FILTER)]
    pub event_filter: f64,

    /// Delay between reconnect attempts
    #[arg(long, default_value_t = DEFAULT_RECONNECT_DELAY_MS)]
    pub reconnect_delay_ms: u64,

    /// Packages accepting mouse move events, optionally restricted to a size
    #[arg(long = "mouse-event", value_name = "PKG[:SIZE]")]
    pub mouse_event: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_SOCKET),
            direct_path: None,
            lock_dir: PathBuf::from(DEFAULT_LOCK_DIR),
            frame_drop: false,
            manual_sync: false,
            sharing: true,
            direct_update: false,
            extra_buffer_count: 0,
            event_filter: DEFAULT_EVENT_FILTER,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            mouse_event: Vec::new(),
        }
    }
}

impl Config {
    pub fn frame_drop(&self) -> bool {
        self.frame_drop
    }

    pub fn manual_sync(&self) -> bool {
        self.manual_sync
    }

    pub fn sharing(&self) -> bool {
        self.sharing
    }

    pub fn direct_update(&self) -> bool {
        self.direct_update
    }

    pub fn extra_buffer_count(&self) -> usize {
        self.extra_buffer_count
    }

    pub fn event_filter(&self) -> f64 {
        self.event_filter
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn direct_path(&self) -> PathBuf {
        self.direct_path.clone().unwrap_or_else(|| {
            PathBuf::from(format!("{}/viewer.{}", DEFAULT_LOCK_DIR, std::process::id()))
        })
    }

    /// Whether instances of `pkgname` at `size` want mouse move events.
    pub fn mouse_event(&self, pkgname: &str, size: Option<SizeType>) -> bool {
        self.mouse_event.iter().any(|entry| match entry.split_once(':') {
            None => entry == pkgname,
            Some((pkg, class)) => {
                pkg == pkgname && size.is_some() && SizeType::parse(class) == size
            }
        })
    }
}
