//! Consumer side of the step protocol.
//!
//! Architecture:
//! ```text
//! Producer 0 ── listener task ──┐
//!                               ├──► bounded queue ──► worker
//! Producer 1 ── listener task ──┘       (FIFO)          │
//!                                                       ├── Store::refresh (follower)
//!                                                       ├── FrameReader::read_step
//!                                                       ├── StepApplier::apply
//!                                                       └── "done" to that producer
//! ```
//!
//! Listener tasks only read sockets and enqueue; the worker is the only
//! code touching the store and the viewer. A producer blocks until its own
//! step is acknowledged, so it never runs more than one step ahead of what
//! the viewer has shown.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use stepwise_store::Store;

use crate::error::{SyncError, SyncResult};
use crate::frame::{ApplyOutcome, FrameReader, StepApplier};
use crate::protocol::{decode_registration, read_message, write_message, Message, MESSAGE_LEN};

/// When the hub stops serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPolicy {
    /// Every client sent `exit` or was lost
    AllClientsDone,
    /// The first client to finish stops the hub
    FirstClientDone,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to listen on
    pub bind_addr: String,
    /// Producers to wait for before serving
    pub n_clients: usize,
    /// Capacity of the shared request queue
    pub queue_capacity: usize,
    /// When `run` returns
    pub stop_policy: StopPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:20000".to_string(),
            n_clients: 1,
            queue_capacity: 64,
            stop_policy: StopPolicy::AllClientsDone,
        }
    }
}

impl HubConfig {
    /// Config for testing: ephemeral port.
    pub fn for_testing(n_clients: usize) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            n_clients,
            queue_capacity: 8,
            ..Self::default()
        }
    }
}

/// Summary of one `run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubReport {
    /// Frames handed to the applier
    pub steps_applied: u64,
    /// Clients that sent `exit`
    pub exited: Vec<i32>,
    /// Clients whose connection failed
    pub lost: Vec<i32>,
    /// The viewer asked to quit
    pub viewer_quit: bool,
}

/// Queue entry produced by listener tasks.
#[derive(Debug)]
enum HubEvent {
    Step { client: i32, step: i32 },
    Exit { client: i32 },
    Lost { client: i32, reason: String },
}

/// The consumer-side hub.
pub struct SyncHub {
    config: HubConfig,
    listener: TcpListener,
    /// Registered connections, by client index
    clients: BTreeMap<i32, TcpStream>,
}

impl SyncHub {
    /// Bind the listening socket. Nothing is accepted until [`SyncHub::accept`].
    pub async fn bind(config: HubConfig) -> SyncResult<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        log::info!("Sync hub listening on {}", listener.local_addr()?);
        Ok(Self {
            config,
            listener,
            clients: BTreeMap::new(),
        })
    }

    /// Bound address (the real port when configured with port 0).
    pub fn local_addr(&self) -> SyncResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Get the hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Accept exactly `n_clients` producers and read their registrations.
    /// Returns the client indices in ascending order.
    ///
    /// A connection that closes before registering, sends a malformed
    /// registration or reuses a registered index is dropped on its own;
    /// clients already registered are kept.
    pub async fn accept(&mut self) -> SyncResult<Vec<i32>> {
        while self.clients.len() < self.config.n_clients {
            let (stream, addr) = self.listener.accept().await?;
            match register(stream).await {
                Ok((client, _)) if self.clients.contains_key(&client) => {
                    log::warn!("Rejected connection from {addr}: {}", SyncError::DuplicateClient(client));
                }
                Ok((client, stream)) => {
                    log::info!("Client {client} registered from {addr}");
                    self.clients.insert(client, stream);
                }
                Err(e) => log::warn!("Dropped connection from {addr} before registration: {e}"),
            }
        }
        Ok(self.clients.keys().copied().collect())
    }

    /// Serve registered clients until the stop policy is met or the viewer
    /// quits.
    pub async fn run<A: StepApplier>(&mut self, store: &mut Store, applier: &mut A) -> SyncResult<HubReport> {
        let (tx, mut rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let mut writers: HashMap<i32, OwnedWriteHalf> = HashMap::new();
        let mut listeners: Vec<JoinHandle<()>> = Vec::new();

        for (client, stream) in std::mem::take(&mut self.clients) {
            let (reader, mut writer) = stream.into_split();
            match write_message(&mut writer, Message::Done).await {
                Ok(()) => {
                    writers.insert(client, writer);
                    listeners.push(tokio::spawn(listen(client, reader, tx.clone())));
                }
                Err(e) => log::warn!("Client {client} lost before start: {e}"),
            }
        }
        drop(tx);

        let mut report = HubReport::default();
        let mut reader = FrameReader::new();
        let mut failure = None;
        let mut active = writers.len();
        log::info!("Sync hub serving {active} client(s)");

        while active > 0 {
            let Some(event) = rx.recv().await else {
                break;
            };
            match event {
                HubEvent::Step { client, step } => {
                    let read = store
                        .refresh()
                        .and_then(|_| reader.read_step(&*store, Some(client), step as i64));
                    let frame = match read {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::error!("Reading step {step} of client {client} failed: {e}");
                            failure = Some(e);
                            send_exit(&mut writers).await;
                            break;
                        }
                    };
                    log::debug!(
                        "Client {client} step {step}: {} object delta(s)",
                        frame.objects.len()
                    );
                    let outcome = applier.apply(&frame);
                    report.steps_applied += 1;

                    if outcome == ApplyOutcome::Quit {
                        log::info!("Viewer closed at client {client} step {step}");
                        report.viewer_quit = true;
                        send_exit(&mut writers).await;
                        break;
                    }
                    let sent = match writers.get_mut(&client) {
                        Some(writer) => write_message(writer, Message::Done).await,
                        None => continue,
                    };
                    if let Err(e) = sent {
                        log::warn!("Client {client} lost while acknowledging: {e}");
                        writers.remove(&client);
                        report.lost.push(client);
                        active -= 1;
                    }
                }
                HubEvent::Exit { client } => {
                    log::info!("Client {client} exited");
                    if writers.remove(&client).is_some() {
                        report.exited.push(client);
                        active -= 1;
                    }
                }
                HubEvent::Lost { client, reason } => {
                    log::warn!("Client {client} lost: {reason}");
                    if writers.remove(&client).is_some() {
                        report.lost.push(client);
                        active -= 1;
                    }
                }
            }
            let finished = report.exited.len() + report.lost.len();
            if self.config.stop_policy == StopPolicy::FirstClientDone && finished > 0 {
                send_exit(&mut writers).await;
                break;
            }
        }

        for handle in listeners {
            handle.abort();
        }
        if let Some(e) = failure {
            return Err(e.into());
        }
        log::info!(
            "Sync hub stopped: {} step(s), exited {:?}, lost {:?}",
            report.steps_applied,
            report.exited,
            report.lost
        );
        Ok(report)
    }
}

/// Read the registration of a freshly accepted connection.
async fn register(mut stream: TcpStream) -> SyncResult<(i32, TcpStream)> {
    stream.set_nodelay(true)?;
    let mut buf = [0u8; MESSAGE_LEN];
    stream.read_exact(&mut buf).await?;
    Ok((decode_registration(buf)?, stream))
}

/// Tell every remaining client to stop.
async fn send_exit(writers: &mut HashMap<i32, OwnedWriteHalf>) {
    for (client, mut writer) in writers.drain() {
        if let Err(e) = write_message(&mut writer, Message::Exit).await {
            log::warn!("Could not send exit to client {client}: {e}");
        }
    }
}

/// Read one client's socket and enqueue what it sends.
async fn listen(client: i32, mut reader: OwnedReadHalf, tx: mpsc::Sender<HubEvent>) {
    loop {
        let event = match read_message(&mut reader).await {
            Ok(Some(Message::Step(step))) => HubEvent::Step { client, step },
            Ok(Some(Message::Exit)) => HubEvent::Exit { client },
            Ok(Some(Message::Done)) => HubEvent::Lost {
                client,
                reason: "unexpected acknowledgement from producer".to_string(),
            },
            Ok(None) => HubEvent::Lost {
                client,
                reason: "connection closed".to_string(),
            },
            Err(e) => HubEvent::Lost {
                client,
                reason: e.to_string(),
            },
        };
        let last = !matches!(event, HubEvent::Step { .. });
        if tx.send(event).await.is_err() || last {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_registration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_accept_orders_clients() {
        let mut hub = SyncHub::bind(HubConfig::for_testing(2)).await.unwrap();
        let addr = hub.local_addr().unwrap();

        let mut a = TcpStream::connect(addr).await.unwrap();
        a.write_all(&encode_registration(5).unwrap()).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        b.write_all(&encode_registration(2).unwrap()).await.unwrap();

        assert_eq!(hub.accept().await.unwrap(), vec![2, 5]);
    }

    #[tokio::test]
    async fn test_duplicate_client_rejected() {
        let mut hub = SyncHub::bind(HubConfig::for_testing(2)).await.unwrap();
        let addr = hub.local_addr().unwrap();

        let mut a = TcpStream::connect(addr).await.unwrap();
        a.write_all(&encode_registration(1).unwrap()).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        b.write_all(&encode_registration(1).unwrap()).await.unwrap();
        let mut c = TcpStream::connect(addr).await.unwrap();
        c.write_all(&encode_registration(4).unwrap()).await.unwrap();

        let accepted = timeout(Duration::from_secs(5), hub.accept()).await.unwrap().unwrap();
        assert_eq!(accepted, vec![1, 4]);
        // The duplicate was closed without a ready signal.
        assert_eq!(read_message(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unregistered_connection_does_not_abort_accept() {
        let mut hub = SyncHub::bind(HubConfig::for_testing(2)).await.unwrap();
        let addr = hub.local_addr().unwrap();

        let mut a = TcpStream::connect(addr).await.unwrap();
        a.write_all(&encode_registration(0).unwrap()).await.unwrap();
        let silent = TcpStream::connect(addr).await.unwrap();
        drop(silent);
        let mut garbled = TcpStream::connect(addr).await.unwrap();
        garbled.write_all(b"done").await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        b.write_all(&encode_registration(1).unwrap()).await.unwrap();

        let accepted = timeout(Duration::from_secs(5), hub.accept()).await.unwrap().unwrap();
        assert_eq!(accepted, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_read_failure_sends_exit_to_everyone() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Store::new(dir.path(), "hub", false).unwrap();
        let config = writer.config().clone();
        writer.close(false).unwrap();
        let mut follower = Store::open_read_only(config).unwrap();

        // A complete frame whose checksum cannot match.
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(follower.path())
            .unwrap();
        std::io::Write::write_all(&mut file, &[4, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4]).unwrap();
        drop(file);

        let mut hub = SyncHub::bind(HubConfig::for_testing(2)).await.unwrap();
        let addr = hub.local_addr().unwrap();
        let mut producers = Vec::new();
        for client in [0, 1] {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&encode_registration(client).unwrap()).await.unwrap();
            producers.push(tokio::spawn(async move {
                assert_eq!(read_message(&mut stream).await.unwrap(), Some(Message::Done));
                if client == 0 {
                    write_message(&mut stream, Message::Step(1)).await.unwrap();
                }
                read_message(&mut stream).await.unwrap()
            }));
        }
        hub.accept().await.unwrap();

        let mut applier = |_: &crate::frame::StepFrame| ApplyOutcome::Continue;
        let err = timeout(Duration::from_secs(5), hub.run(&mut follower, &mut applier))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        for producer in producers {
            let reply = timeout(Duration::from_secs(5), producer).await.unwrap().unwrap();
            assert_eq!(reply, Some(Message::Exit));
        }
    }
}
