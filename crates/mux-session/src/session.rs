//! A single logical stream inside a multiplexed connection.
//!
//! A `Session` owns its input and output capabilities and, once registered
//! with a [`SessionManager`], a private token handoff shared only with the
//! manager's token scheduler.

use crate::manager::{Inner, SessionManager};
use mux_core::{
    BufferedReader, Handoff, Link, MultiBuffer, MuxError, MuxResult, PacketReader, Reader,
    StreamReader, TransferType, TryOfferError, Writer,
};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::io::AsyncRead;
use tokio::sync::{watch, Mutex, OnceCell};
use tracing::{debug, trace, warn};

/// A client connection inside a mux connection.
pub struct Session {
    id: u16,
    transfer_type: TransferType,
    input: Mutex<Box<dyn Reader>>,
    output: Mutex<Box<dyn Writer>>,
    /// Token handoff between this session and the scheduler.
    tokens: Handoff<u16>,
    /// Shared demand handoff of the owning manager; `None` until registered.
    demand: Option<Handoff<u16>>,
    owner: Weak<Inner>,
    /// Flips to `true` when closing starts; interrupts in-flight I/O.
    shutdown: watch::Sender<bool>,
    /// Set once output and input have both been closed.
    streams_closed: OnceCell<()>,
}

impl Session {
    /// Build an unregistered session with a caller-chosen ID.
    ///
    /// Pass it to [`SessionManager::add`] before reading from it.
    pub fn new(id: u16, transfer_type: TransferType, link: Link) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            transfer_type,
            input: Mutex::new(link.reader),
            output: Mutex::new(link.writer),
            tokens: Handoff::new(),
            demand: None,
            owner: Weak::new(),
            shutdown,
            streams_closed: OnceCell::new(),
        }
    }

    /// Bind this session to `manager` with a fresh token handoff.
    pub(crate) fn register(mut self, manager: &Arc<Inner>) -> Self {
        self.tokens = Handoff::new();
        self.demand = Some(manager.demand.clone());
        self.owner = Arc::downgrade(manager);
        self
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    /// Whether the session's streams have been closed.
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Whether a reader is parked waiting for a scheduler token.
    pub fn is_waiting(&self) -> bool {
        self.tokens.has_waiter()
    }

    /// Offer a token without blocking. Used by the scheduler's scan pass.
    pub(crate) fn offer_token(&self, token: u16) -> bool {
        self.tokens.try_offer(token).is_ok()
    }

    fn owner(&self) -> Option<SessionManager> {
        self.owner.upgrade().map(SessionManager::from_inner)
    }

    /// Close all resources associated with this session and deregister it.
    ///
    /// Output is closed before input. Close failures are logged and never
    /// stop the sequence.
    pub async fn close(&self) -> MuxResult<()> {
        self.close_streams().await;
        if let Some(owner) = self.owner() {
            owner.remove(self.id).await;
        }
        Ok(())
    }

    /// Close output then input exactly once, releasing any parked reader.
    /// Does not touch the owner's registry.
    ///
    /// A caller that arrives while another close is in progress returns only
    /// after both streams are closed.
    pub(crate) async fn close_streams(&self) {
        self.streams_closed
            .get_or_init(|| async {
                self.shutdown.send_replace(true);
                self.tokens.close();

                if let Err(e) = self.output.lock().await.close().await {
                    warn!(session_id = self.id, error = %e, "failed to close session output");
                }
                if let Err(e) = self.input.lock().await.close().await {
                    warn!(session_id = self.id, error = %e, "failed to close session input");
                }
                debug!(session_id = self.id, "session streams closed");
            })
            .await;
    }

    /// Wrap the raw multiplexed source in the reader matching this session's
    /// transfer type.
    pub fn new_reader<'a, R>(&self, reader: &'a mut BufferedReader<R>) -> Box<dyn Reader + 'a>
    where
        R: AsyncRead + Unpin + Send + 'a,
    {
        match self.transfer_type {
            TransferType::Stream => Box::new(StreamReader::new(reader)),
            TransferType::Packet => Box::new(PacketReader::new(reader)),
        }
    }

    /// Wait for read permission from the scheduler, then read one
    /// multi-buffer from the input.
    ///
    /// Errors from the input are returned as-is.
    pub async fn read_multi_buffer(&self) -> MuxResult<MultiBuffer> {
        self.acquire_token().await?;

        let mut shutdown = self.shutdown.subscribe();
        let mut input = self.input.lock().await;
        if *shutdown.borrow() {
            return Err(MuxError::SessionClosed(self.id));
        }

        tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => Err(MuxError::SessionClosed(self.id)),
            result = input.read_multi_buffer() => result,
        }
    }

    /// Write one multi-buffer to the output.
    pub async fn write_multi_buffer(&self, mb: MultiBuffer) -> MuxResult<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut output = self.output.lock().await;
        if *shutdown.borrow() {
            return Err(MuxError::SessionClosed(self.id));
        }

        tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => Err(MuxError::SessionClosed(self.id)),
            result = output.write_multi_buffer(mb) => result,
        }
    }

    async fn acquire_token(&self) -> MuxResult<()> {
        let demand = self
            .demand
            .as_ref()
            .ok_or(MuxError::NotRegistered(self.id))?;

        // Register for a token before announcing demand, so a scan pass that
        // runs in between still finds us waiting.
        let token = self
            .tokens
            .waiter()
            .ok_or(MuxError::SessionClosed(self.id))?;

        // The scheduler registers for demand before each scan, so this offer
        // can also be taken mid-scan, not only while idle.
        match demand.try_offer(self.id) {
            Ok(()) => {
                // The scheduler took our signal; that is permission enough.
                trace!(session_id = self.id, "demand signal taken");
                return Ok(());
            }
            Err(TryOfferError::Closed(_)) => return Err(MuxError::ManagerClosed),
            Err(TryOfferError::NoReceiver(_)) => {}
        }

        match token.recv().await {
            Some(_) => Ok(()),
            None => Err(MuxError::SessionClosed(self.id)),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transfer_type", &self.transfer_type)
            .field("registered", &self.demand.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}
