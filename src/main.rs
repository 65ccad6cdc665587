//! dbox-viewer - command line viewer for dynamicbox providers
//!
//! Connects to the master, optionally creates an instance, and logs every
//! event and fault it sees. Reconnects when the master restarts.
//!
//! ```text
//! dbox-viewer watch
//! dbox-viewer add org.example.weather --size 2x2 --period 1800
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dynamicbox_viewer::{
    callback, Config, DeleteType, Event, HandleState, Session, SessionHandle, SizeType,
    SystemBackend, Viewer, Visibility,
};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::oneshot;

/// How long a clean exit waits for the master to confirm deletion.
const DELETE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "dbox-viewer")]
#[command(about = "Viewer client for dynamicbox providers")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    conf: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log events of instances other viewers and the system create
    Watch,

    /// Create an instance and keep it alive until interrupted
    Add {
        /// Provider package name
        pkgname: String,

        /// Content string handed to the provider
        #[arg(long)]
        content: Option<String>,

        #[arg(long, default_value = "user,created")]
        cluster: String,

        #[arg(long, default_value = "default")]
        category: String,

        /// Update period in seconds (-1 for the provider's default)
        #[arg(long, default_value_t = -1.0, allow_hyphen_values = true)]
        period: f64,

        /// Size class, e.g. 1x1, 2x2, 4x4
        #[arg(long, default_value = "1x1", value_parser = parse_size)]
        size: SizeType,
    },
}

fn parse_size(s: &str) -> Result<SizeType> {
    SizeType::parse(s).with_context(|| format!("unknown size class {s:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dynamicbox_viewer=info".parse()?)
                .add_directive("x11rb=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let viewer = Viewer::new(cli.conf, Box::new(SystemBackend::new()));
    let (mut session, handle) = Session::new(viewer);
    log_activity(session.viewer_mut());

    let added = match cli.command {
        Commands::Watch => None,
        Commands::Add {
            pkgname,
            content,
            cluster,
            category,
            period,
            size,
        } => {
            let name = pkgname.clone();
            session.on_connect(move |v| {
                let cb = callback(|v, h, status| match status {
                    Ok(()) => {
                        tracing::info!("{h}: created as {:?}", v.id(h).ok().flatten());
                        if let Err(e) = v.set_visibility(h, Visibility::Shown) {
                            tracing::warn!("{h}: cannot show: {e}");
                        }
                    }
                    Err(e) => tracing::error!("{h}: create failed: {e}"),
                });
                if let Err(e) = v.add(
                    &pkgname,
                    content.as_deref(),
                    &cluster,
                    &category,
                    period,
                    size,
                    cb,
                ) {
                    tracing::error!("{pkgname}: add failed: {e}");
                }
            });
            Some(name)
        }
    };

    tokio::spawn(shutdown_on_ctrl_c(handle, added));
    session.run().await
}

/// Log every event and fault the viewer reports.
fn log_activity(viewer: &mut Viewer) {
    viewer.add_event_handler(|v, h, event| {
        let pkgname = v.pkgname(h).unwrap_or("?");
        match event {
            Event::DboxUpdated | Event::GbarUpdated => tracing::debug!("{h} {pkgname}: {event:?}"),
            _ => tracing::info!("{h} {pkgname}: {event:?}"),
        }
        ControlFlow::Continue(())
    });
    viewer.add_fault_handler(|_, fault| {
        tracing::warn!(
            "fault {:?}: {} {} in {}",
            fault.kind,
            fault.pkgname.as_deref().unwrap_or("-"),
            fault.id.as_deref().unwrap_or("-"),
            fault.func.as_deref().unwrap_or("-"),
        );
        ControlFlow::Continue(())
    });
}

/// On Ctrl-C delete what this viewer created, then stop the session.
async fn shutdown_on_ctrl_c(handle: SessionHandle, added: Option<String>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for ctrl-c: {e}");
        return;
    }
    let Some(pkgname) = added else {
        return;
    };

    let (tx, rx) = oneshot::channel();
    let queued = handle.run(move |v| {
        let mine: Vec<_> = v
            .handles()
            .into_iter()
            .filter(|&h| v.state(h) == HandleState::Active && v.pkgname(h) == Ok(pkgname.as_str()))
            .collect();
        let Some((&last, rest)) = mine.split_last() else {
            let _ = tx.send(());
            return;
        };
        for &h in rest {
            if let Err(e) = v.delete(h, DeleteType::Permanently, None) {
                tracing::warn!("{h}: delete failed: {e}");
            }
        }
        let cb = callback(move |_, h, status| {
            tracing::info!("{h}: deleted ({status:?})");
            let _ = tx.send(());
        });
        if let Err(e) = v.delete(last, DeleteType::Permanently, cb) {
            tracing::warn!("{last}: delete failed: {e}");
        }
    });
    if queued.is_ok() && tokio::time::timeout(DELETE_TIMEOUT, rx).await.is_err() {
        tracing::warn!("master did not confirm deletion");
    }
}
