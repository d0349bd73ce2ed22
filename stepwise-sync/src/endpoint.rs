//! Producer side of the step protocol.
//!
//! ```text
//!  add_object / update_object            render()
//!  ───────────────────────────►  ┌───────────────────────────────┐
//!   write row `step + 1`,        │ placeholders for Untouched    │
//!   mark Touched                 │ reset flags, flush journal    │
//!                                │ step += 1, send step          │
//!                                │ await "done" / "exit"         │
//!                                └───────────────────────────────┘
//! ```
//!
//! Every tracked table gains exactly one row per step, so `row id == step`
//! for every object table. Non-storing endpoints keep one row per object
//! and overwrite it instead.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;

use stepwise_store::{ColumnSpec, Record, Store, TableRole};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{encode_registration, read_message, write_message, Message};
use crate::tracked::TrackedName;

/// Writer store shared by the endpoints of one producer process.
pub type SharedStore = Arc<Mutex<Store>>;

/// Endpoint configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Consumer address
    pub addr: String,
    /// Position of this producer on the consumer side
    pub client_index: i32,
    /// Give up dialing after this long
    pub connect_timeout: Duration,
    /// Pause between refused dials
    pub retry_interval: Duration,
    /// Overwrite a single row per object instead of one row per step
    pub non_storing: bool,
    /// No consumer: render never touches a socket
    pub offscreen: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:20000".to_string(),
            client_index: 0,
            connect_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_millis(50),
            non_storing: false,
            offscreen: false,
        }
    }
}

impl EndpointConfig {
    /// Config for testing (short timeouts).
    pub fn for_testing(addr: impl Into<String>, client_index: i32) -> Self {
        Self {
            addr: addr.into(),
            client_index,
            connect_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(10),
            ..Self::default()
        }
    }
}

/// Result of one `render()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    /// The consumer applied the step
    Acknowledged,
    /// The consumer answered `exit`; the connection is closed
    ConsumerExited,
    /// No connection (offscreen or never connected); rows were still written
    Offline,
}

enum Link {
    Offline,
    Connected(TcpStream),
    Closed,
}

struct TrackedObject {
    name: TrackedName,
    touched: bool,
}

/// One producer's view of the protocol.
pub struct SyncEndpoint {
    config: EndpointConfig,
    store: SharedStore,
    objects: Vec<TrackedObject>,
    /// Last published step; 0 before the first render
    step: i32,
    link: Link,
}

impl SyncEndpoint {
    pub fn new(store: SharedStore, config: EndpointConfig) -> Self {
        Self {
            config,
            store,
            objects: Vec::new(),
            step: 0,
            link: Link::Offline,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn step(&self) -> i32 {
        self.step
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.link, Link::Connected(_))
    }

    /// Table of an object. Negative ids count from the last object.
    pub fn table_name(&self, object: i64) -> SyncResult<String> {
        Ok(self.objects[self.resolve(object)?].name.table_name())
    }

    /// Row the current step writes to.
    fn open_row(&self) -> usize {
        if self.config.non_storing {
            1
        } else {
            self.step as usize + 1
        }
    }

    fn resolve(&self, object: i64) -> SyncResult<usize> {
        let n = self.objects.len() as i64;
        let index = if object < 0 { n + object } else { object };
        if (0..n).contains(&index) {
            Ok(index as usize)
        } else {
            Err(SyncError::UnknownObject(object))
        }
    }

    // ─── Objects ─────────────────────────────────────────────

    /// Create a tracked object and write its first row at the open step.
    /// Returns the object id.
    pub async fn add_object(&mut self, kind: &str, columns: &[ColumnSpec], record: Record) -> SyncResult<usize> {
        let id = self.objects.len();
        let name = TrackedName::new(kind, self.config.client_index, id)?;
        let table = name.table_name();
        let open = self.open_row();
        {
            let mut store = self.store.lock().await;
            store.create_table(&table, TableRole::Storing, columns)?;
            store.pad_to(&table, open - 1)?;
            store.insert(&table, record)?;
        }
        log::debug!("Added object {table} at row {open}");
        self.objects.push(TrackedObject { name, touched: true });
        Ok(id)
    }

    /// Write the given fields of an object at the open step. Only the
    /// provided fields are stored; the rest of the row stays null.
    pub async fn update_object(&mut self, kind: &str, object: i64, record: Record) -> SyncResult<()> {
        let index = self.resolve(object)?;
        let tracked = &self.objects[index];
        if !tracked.name.is_kind(kind) {
            return Err(SyncError::KindMismatch {
                id: index,
                actual: tracked.name.kind.clone(),
                requested: kind.to_string(),
            });
        }
        let table = tracked.name.table_name();
        let open = self.open_row();
        {
            let mut store = self.store.lock().await;
            if !tracked.touched {
                store.pad_to(&table, open)?;
            }
            store.update(&table, record, open as i64)?;
        }
        self.objects[index].touched = true;
        Ok(())
    }

    // ─── Protocol ────────────────────────────────────────────

    /// Dial the consumer, register, and wait for its ready signal.
    /// Refused dials are retried until `connect_timeout`.
    pub async fn connect(&mut self) -> SyncResult<()> {
        if self.config.offscreen {
            return Ok(());
        }
        let deadline = Instant::now() + self.config.connect_timeout;
        let mut stream = loop {
            match TcpStream::connect(&self.config.addr).await {
                Ok(stream) => break stream,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    if Instant::now() >= deadline {
                        return Err(SyncError::Timeout(self.config.connect_timeout));
                    }
                    tokio::time::sleep(self.config.retry_interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        stream.set_nodelay(true)?;
        stream.write_all(&encode_registration(self.config.client_index)?).await?;

        match read_message(&mut stream).await? {
            Some(Message::Done) => {
                log::info!(
                    "Client {} connected to {}",
                    self.config.client_index,
                    self.config.addr
                );
                self.link = Link::Connected(stream);
                Ok(())
            }
            Some(Message::Exit) | None => {
                self.link = Link::Closed;
                Err(SyncError::Closed)
            }
            Some(other) => Err(SyncError::Protocol(format!(
                "expected ready signal, got {other:?}"
            ))),
        }
    }

    /// Close the current step and hand it to the consumer.
    ///
    /// Once the consumer has sent `exit` (or after [`SyncEndpoint::close`])
    /// this fails with `Closed` and writes nothing.
    pub async fn render(&mut self) -> SyncResult<RenderStatus> {
        if matches!(self.link, Link::Closed) {
            return Err(SyncError::Closed);
        }
        let next = if self.config.non_storing {
            1
        } else {
            self.step
                .checked_add(1)
                .ok_or(SyncError::StepOverflow(self.step as i64 + 1))?
        };
        let open = self.open_row();
        {
            let mut store = self.store.lock().await;
            if !self.config.non_storing {
                for object in self.objects.iter().filter(|o| !o.touched) {
                    store.pad_to(&object.name.table_name(), open)?;
                }
            }
            store.flush()?;
        }
        // Reset only once the step is on disk.
        for object in &mut self.objects {
            object.touched = false;
        }
        self.step = next;

        if self.config.offscreen {
            return Ok(RenderStatus::Offline);
        }
        let stream = match &mut self.link {
            Link::Offline => return Ok(RenderStatus::Offline),
            Link::Closed => return Err(SyncError::Closed),
            Link::Connected(stream) => stream,
        };

        let reply = match write_message(stream, Message::Step(next)).await {
            Ok(()) => read_message(stream).await,
            Err(e) => Err(e),
        };
        match reply {
            Ok(Some(Message::Done)) => {
                log::debug!("Client {}: step {next} acknowledged", self.config.client_index);
                Ok(RenderStatus::Acknowledged)
            }
            Ok(Some(Message::Exit)) => {
                log::info!("Client {}: consumer exited at step {next}", self.config.client_index);
                if let Err(e) = stream.shutdown().await {
                    log::debug!("Client {}: shutdown after exit failed: {e}", self.config.client_index);
                }
                self.link = Link::Closed;
                Ok(RenderStatus::ConsumerExited)
            }
            Ok(Some(Message::Step(s))) => {
                self.link = Link::Closed;
                Err(SyncError::Protocol(format!(
                    "consumer sent step {s} instead of an acknowledgement"
                )))
            }
            Ok(None) => {
                self.link = Link::Closed;
                Err(SyncError::ConnectionLost("consumer closed the connection".to_string()))
            }
            Err(e) => {
                self.link = Link::Closed;
                Err(e)
            }
        }
    }

    /// Flush the store and tell the consumer this producer is done.
    pub async fn close(&mut self) -> SyncResult<()> {
        self.store.lock().await.flush()?;
        let link = std::mem::replace(&mut self.link, Link::Closed);
        if let Link::Connected(mut stream) = link {
            write_message(&mut stream, Message::Exit).await?;
            if let Err(e) = stream.shutdown().await {
                log::debug!("Client {}: shutdown on close failed: {e}", self.config.client_index);
            }
            log::info!("Client {} closed", self.config.client_index);
        }
        Ok(())
    }
}
