//! dynamicbox-viewer - client side of the dynamicbox protocol
//!
//! A viewer asks the master to create provider instances, shares one
//! instance between consumers that want the same thing, mirrors the
//! provider's buffers and routes the master's replies and notifications to
//! per-handle callbacks and global observers.
//!
//! ```no_run
//! use dynamicbox_viewer::{callback, Config, Session, SizeType, SystemBackend, Viewer};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let viewer = Viewer::new(Config::default(), Box::new(SystemBackend::new()));
//! let (mut session, handle) = Session::new(viewer);
//! session.on_connect(|v| {
//!     let cb = callback(|_, h, status| println!("{h}: created {status:?}"));
//!     let _ = v.add("weather", None, "home", "default", 1800.0, SizeType::S2x2, cb);
//! });
//! # drop(handle);
//! session.run().await
//! # }
//! ```

pub mod buffer;
mod callback;
mod common;
pub mod conf;
mod handle;
pub mod packet;
mod registry;
pub mod session;
pub mod status;
pub mod transport;
pub mod types;
mod viewer;

pub use buffer::{Buffer, BufferBackend, BufferKind, SystemBackend};
pub use callback::{callback, resource_callback, Callback, ResourceCallback};
pub use conf::Config;
pub use registry::{EventHandler, FaultHandler, ObserverId};
pub use session::{Session, SessionHandle};
pub use status::{DboxError, Status};
pub use transport::{ChannelTransport, Transport};
pub use types::{
    AccessEvent, BufferType, DeleteType, Event, Fault, FaultKind, Handle, HandleState, KeyEvent,
    MouseEvent, Rect, Size, SizeType, Target, Visibility,
};
pub use viewer::{TextSignal, Viewer};
