//! Master connection loop.
//!
//! The [`Viewer`] is not `Send`: it stays on the task that awaits
//! [`Session::run`]. Socket reads and writes run on spawned tasks and talk to
//! it over channels. Other tasks reach the viewer through a
//! [`SessionHandle`].

use crate::packet::{read_packet, write_packet, Packet};
use crate::transport::ChannelTransport;
use crate::viewer::Viewer;
use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Work sent to the viewer from another task.
pub type Command = Box<dyn FnOnce(&mut Viewer) + Send>;

/// Runs every time a connection comes up, after the handshake was sent.
type ConnectHook = Box<dyn FnMut(&mut Viewer)>;

#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Queue `f` to run on the viewer. Dropping every handle ends the
    /// session.
    pub fn run(&self, f: impl FnOnce(&mut Viewer) + Send + 'static) -> Result<()> {
        self.tx
            .send(Box::new(f))
            .map_err(|_| anyhow!("session stopped"))
    }
}

pub struct Session {
    viewer: Viewer,
    commands: mpsc::UnboundedReceiver<Command>,
    on_connect: Option<ConnectHook>,
}

enum Exit {
    /// Every handle is gone
    Closed,
    Disconnected,
}

/// Socket tasks of one connection; aborted when dropped.
struct Link {
    outbound: mpsc::UnboundedSender<Packet>,
    inbound: mpsc::UnboundedReceiver<Packet>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Session {
    pub fn new(viewer: Viewer) -> (Self, SessionHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let session = Self {
            viewer,
            commands,
            on_connect: None,
        };
        (session, SessionHandle { tx })
    }

    pub fn viewer_mut(&mut self) -> &mut Viewer {
        &mut self.viewer
    }

    pub fn on_connect(&mut self, hook: impl FnMut(&mut Viewer) + 'static) {
        self.on_connect = Some(Box::new(hook));
    }

    /// Connect, serve and reconnect until every [`SessionHandle`] is dropped.
    pub async fn run(mut self) -> Result<()> {
        loop {
            match self.connect().await {
                Ok(link) => match self.serve(link).await {
                    Exit::Closed => return Ok(()),
                    Exit::Disconnected => self.viewer.disconnected(),
                },
                Err(e) => tracing::warn!("{e:#}"),
            }

            let delay = self.viewer.conf().reconnect_delay();
            tracing::info!("reconnecting in {delay:?}");
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = self.commands.recv() => match cmd {
                        Some(cmd) => self.apply(cmd),
                        None => return Ok(()),
                    },
                }
            }
        }
    }

    fn apply(&mut self, cmd: Command) {
        cmd(&mut self.viewer);
        self.viewer.run_jobs();
    }

    async fn connect(&mut self) -> Result<Link> {
        let conf = self.viewer.conf();
        let stream = UnixStream::connect(&conf.socket)
            .await
            .with_context(|| format!("failed to connect to {}", conf.socket.display()))?;
        tracing::info!("connected to {}", conf.socket.display());

        let (in_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, out_rx) = mpsc::unbounded_channel();
        let (read, write) = stream.into_split();
        let mut tasks = vec![
            tokio::spawn(read_loop(read, in_tx.clone())),
            tokio::spawn(write_loop(write, out_rx)),
        ];

        if conf.direct_update() {
            let path = conf.direct_path();
            match bind_direct(&path) {
                Ok(listener) => tasks.push(tokio::spawn(accept_loop(listener, in_tx))),
                Err(e) => tracing::warn!("direct updates disabled: {e:#}"),
            }
        }

        Ok(Link {
            outbound,
            inbound,
            tasks,
        })
    }

    async fn serve(&mut self, mut link: Link) -> Exit {
        self.viewer
            .attach(Box::new(ChannelTransport::new(link.outbound.clone())));
        let direct = self.viewer.conf().direct_update().then(|| {
            self.viewer
                .conf()
                .direct_path()
                .to_string_lossy()
                .into_owned()
        });
        if let Err(e) = self.viewer.hello(direct.as_deref()) {
            tracing::warn!("handshake not sent: {e}");
        }
        if let Some(hook) = self.on_connect.as_mut() {
            hook(&mut self.viewer);
        }

        loop {
            self.viewer.run_jobs();
            tokio::select! {
                packet = link.inbound.recv() => match packet {
                    Some(packet) => self.viewer.dispatch(packet),
                    None => return Exit::Disconnected,
                },
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => cmd(&mut self.viewer),
                    None => return Exit::Closed,
                },
                // Jobs queued by jobs run on the next pass.
                _ = tokio::task::yield_now(), if self.viewer.has_jobs() => {}
            }
        }
    }
}

fn bind_direct(path: &Path) -> Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path).with_context(|| format!("failed to bind {}", path.display()))
}

async fn read_loop(mut read: OwnedReadHalf, tx: mpsc::UnboundedSender<Packet>) {
    loop {
        match read_packet(&mut read).await {
            Ok(Some(packet)) => {
                if tx.send(packet).is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("master closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!("read error: {e:#}");
                break;
            }
        }
    }
}

async fn write_loop(mut write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Packet>) {
    while let Some(packet) = rx.recv().await {
        if let Err(e) = write_packet(&mut write, &packet).await {
            tracing::warn!("write error: {e:#}");
            break;
        }
    }
}

/// Providers push updates straight to the viewer over this socket. What
/// arrives here is dispatched like traffic from the master.
async fn accept_loop(listener: UnixListener, tx: mpsc::UnboundedSender<Packet>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let (read, _write) = stream.into_split();
                tokio::spawn(read_loop(read, tx.clone()));
            }
            Err(e) => {
                tracing::warn!("direct accept: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SystemBackend;
    use crate::conf::Config;
    use crate::packet::{PacketKind, Value};
    use crate::status::DboxError;
    use crate::types::FaultKind;
    use std::cell::RefCell;
    use std::ops::ControlFlow;
    use std::rc::Rc;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn session(socket: &Path) -> (Session, SessionHandle) {
        let conf = Config {
            socket: socket.to_path_buf(),
            reconnect_delay_ms: 10,
            ..Config::default()
        };
        Session::new(Viewer::new(conf, Box::new(SystemBackend::new())))
    }

    async fn expect_hello(stream: &mut UnixStream) -> Packet {
        let hello = timeout(WAIT, read_packet(stream))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(hello.kind, PacketKind::Request);
        assert_eq!(hello.command, "acquire");
        hello
    }

    #[tokio::test]
    async fn test_handshake_and_master_request() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("master");
        let listener = UnixListener::bind(&socket).unwrap();
        let (session, handle) = session(&socket);

        let master = async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let hello = expect_hello(&mut stream).await;
            let reply = Packet::reply(hello.seq, "acquire", vec![0i32.into(), 2i32.into()]);
            write_packet(&mut stream, &reply).await.unwrap();

            let mut req = Packet::request("scroll", vec!["clock".into(), "c1".into(), 1i32.into()]);
            req.seq = 7;
            write_packet(&mut stream, &req).await.unwrap();
            let answer = timeout(WAIT, read_packet(&mut stream))
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(answer.kind, PacketKind::Reply);
            assert_eq!(answer.seq, 7);
            assert_eq!(answer.args, vec![Value::Int(DboxError::NotExist.code())]);

            let (tx, rx) = oneshot::channel();
            handle
                .run(move |v| {
                    let _ = tx.send(v.conf().extra_buffer_count());
                })
                .unwrap();
            assert_eq!(timeout(WAIT, rx).await.unwrap().unwrap(), 2);
            drop(handle);
            stream
        };

        let (result, _stream) = tokio::join!(session.run(), master);
        result.unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_master_exit() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("master");
        let listener = UnixListener::bind(&socket).unwrap();
        let (mut session, handle) = session(&socket);

        let faults = Rc::new(RefCell::new(Vec::new()));
        let f = faults.clone();
        session.viewer_mut().add_fault_handler(move |_, fault| {
            f.borrow_mut().push(fault.kind);
            ControlFlow::Continue(())
        });
        let connects = Rc::new(RefCell::new(0));
        let c = connects.clone();
        session.on_connect(move |_| *c.borrow_mut() += 1);

        let master = async move {
            let (mut first, _) = listener.accept().await.unwrap();
            expect_hello(&mut first).await;
            drop(first);

            let (mut second, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
            expect_hello(&mut second).await;
            drop(handle);
        };

        let (result, ()) = tokio::join!(session.run(), master);
        result.unwrap();
        assert_eq!(*faults.borrow(), vec![FaultKind::ProviderDisconnected]);
        assert_eq!(*connects.borrow(), 2);
    }

    #[tokio::test]
    async fn test_commands_run_while_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let (session, handle) = session(&dir.path().join("missing"));

        let client = async move {
            let (tx, rx) = oneshot::channel();
            handle
                .run(move |v| {
                    let _ = tx.send(v.is_connected());
                })
                .unwrap();
            assert!(!timeout(WAIT, rx).await.unwrap().unwrap());
        };

        let (result, ()) = tokio::join!(session.run(), client);
        result.unwrap();
    }
}
