//! NodeDriver: the runtime shell around one node.
//!
//! Two activities run side by side:
//!
//! 1. the node loop, a dedicated OS thread that calls [`Node::poll`] until
//!    the shutdown flag is raised, sleeping between idle passes;
//! 2. the listener, which registers with the dispatcher, connects to the
//!    assigned port and serves requests until shutdown, disconnect, or a
//!    protocol fault.
//!
//! They share the node only through its own locking. Either side failing
//! stops the other, and the first error is returned from [`NodeDriver::run`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use conclave_net::{read_packet, request_port, write_packet, NetError, MAX_PACKET_BYTES};
use conclave_pipeline::Node;
use conclave_types::NodeOptions;

use crate::listener::{handle_packet, Reply};

/// Pause between passes while pipelines are busy, so the loop does not spin.
const BUSY_PAUSE: Duration = Duration::from_millis(1);

pub struct NodeDriver {
    node: Arc<dyn Node>,
    options: NodeOptions,
    shutdown: Arc<AtomicBool>,
}

impl NodeDriver {
    pub fn new(node: Arc<dyn Node>, options: NodeOptions) -> Self {
        Self {
            node,
            options,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run until the dispatcher asks for shutdown or hangs up. Every
    /// supervised process is killed before returning.
    pub async fn run(self) -> Result<()> {
        let (loop_done_tx, loop_done_rx) = oneshot::channel::<()>();
        let node_loop = {
            let node = Arc::clone(&self.node);
            let shutdown = Arc::clone(&self.shutdown);
            let tick = self.options.tick_interval();
            thread::Builder::new()
                .name(format!("{}-node-loop", self.node.kind()))
                .spawn(move || {
                    // Dropped on exit, waking the listener.
                    let _done = loop_done_tx;
                    run_node_loop(node.as_ref(), &shutdown, tick)
                })
                .context("failed to spawn node loop thread")?
        };

        let listened = self.listen(loop_done_rx).await;
        if let Err(e) = &listened {
            error!(error = %e, "dispatcher link failed");
        }

        self.shutdown.store(true, Ordering::SeqCst);
        let looped = tokio::task::spawn_blocking(move || node_loop.join())
            .await
            .context("failed to join node loop")?
            .map_err(|_| anyhow!("node loop panicked"))?;
        self.node.terminate();

        listened?;
        looped?;
        info!("node stopped");
        Ok(())
    }

    async fn listen(&self, mut loop_done: oneshot::Receiver<()>) -> Result<()> {
        let dispatcher = self.options.dispatcher.as_str();
        let mut master = TcpStream::connect(dispatcher)
            .await
            .with_context(|| format!("cannot reach dispatcher at {dispatcher}"))?;
        let host = master.peer_addr()?.ip();

        let assignment = request_port(&mut master, self.node.kind())
            .await
            .context("port registration failed")?;
        drop(master);

        let node_id = assignment.node_id;
        self.node.set_node_id(node_id);
        let mut link = TcpStream::connect((host, assignment.port))
            .await
            .with_context(|| format!("cannot connect to assigned port {}", assignment.port))?;
        info!(node_id, kind = %self.node.kind(), port = assignment.port, "connected to dispatcher");

        loop {
            let packet = tokio::select! {
                packet = read_packet(&mut link, MAX_PACKET_BYTES) => packet,
                _ = &mut loop_done => {
                    warn!("node loop stopped, closing dispatcher link");
                    return Ok(());
                }
            };

            let packet = match packet {
                Ok(packet) => packet,
                Err(NetError::Closed) => {
                    info!("dispatcher closed the connection");
                    return Ok(());
                }
                Err(e) if e.is_protocol_fault() => {
                    error!(error = %e, "dispatcher sent a malformed frame");
                    return Err(e).context("protocol fault on dispatcher link");
                }
                Err(e) => return Err(e).context("failed to read dispatcher request"),
            };

            match handle_packet(self.node.as_ref(), &packet, node_id)
                .with_context(|| format!("protocol fault on {:?}", packet.kind()))?
            {
                Reply::None => {}
                Reply::Packet(reply) => write_packet(&mut link, &reply)
                    .await
                    .context("failed to send reply")?,
                Reply::Shutdown => return Ok(()),
            }
        }
    }
}

/// Poll until `shutdown` is raised. An error escaping the node is fatal.
fn run_node_loop(node: &dyn Node, shutdown: &AtomicBool, tick: Duration) -> Result<()> {
    info!(kind = %node.kind(), "node loop started");
    while !shutdown.load(Ordering::SeqCst) {
        let active = node.poll().context("node poll failed")?;
        thread::sleep(if active { BUSY_PAUSE } else { tick });
    }
    Ok(())
}
