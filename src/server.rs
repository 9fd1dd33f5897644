//! TNP TCP server: accepts clients on port 36867 and binds each to a
//! session task, enforcing the concurrent client cap.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::net::TcpListener;

use crate::mirror::GattMirror;
use crate::session;

/// Fixed TNP listen port.
pub const TNP_PORT: u16 = 36867;

/// Default concurrent client cap.
pub const MAX_CLIENTS: usize = 1;

/// Bind the listener (dual-stack where the OS allows) and serve forever.
pub async fn run(
    mirror: Arc<GattMirror>,
    port: u16,
    max_clients: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = match TcpListener::bind(("::", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("IPv6 bind failed ({}), falling back to IPv4", e);
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?
        }
    };
    run_with_listener(listener, mirror, max_clients).await
}

/// Serve an already-bound listener. Split out so tests can bind an
/// ephemeral port first.
pub async fn run_with_listener(
    listener: TcpListener,
    mirror: Arc<GattMirror>,
    max_clients: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("TNP server listening on {}", listener.local_addr()?);

    let active = Arc::new(AtomicUsize::new(0));
    loop {
        let (stream, addr) = listener.accept().await?;

        if active.load(Ordering::SeqCst) >= max_clients {
            info!("Rejecting TNP client {}: {} client(s) already connected", addr, max_clients);
            drop(stream);
            continue;
        }

        active.fetch_add(1, Ordering::SeqCst);
        let mirror = mirror.clone();
        let active = active.clone();
        tokio::spawn(async move {
            session::run(stream, mirror).await;
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }
}
