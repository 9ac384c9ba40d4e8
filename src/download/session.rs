use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::time::{interval, sleep_until, MissedTickBehavior};
use tracing::{debug, trace};

use super::context::{PeerCommand, SwarmContext};
use crate::constants::MAX_REQUEST_LENGTH;
use crate::peer::{
    Bitfield, Block, BlockRequest, CloseReason, Message, PeerConnection, PeerError, PeerState,
};

/// How a session ended.
#[derive(Debug)]
pub(crate) struct SessionReport {
    pub addr: SocketAddr,
    pub reason: CloseReason,
    /// Whether the handshake completed.
    pub connected: bool,
}

/// Runs one peer from dial to close. Never fails: every way out is a
/// [`CloseReason`].
pub(crate) async fn run(ctx: Arc<SwarmContext>, addr: SocketAddr) -> SessionReport {
    let info_hash = *ctx.descriptor.info_hash().as_bytes();
    let timeouts = ctx.config.connection_timeouts();

    let conn = match PeerConnection::connect(addr, info_hash, ctx.config.peer_id, timeouts).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!("{}: connect failed: {}", addr, e);
            return SessionReport {
                addr,
                reason: CloseReason::from(e),
                connected: false,
            };
        }
    };

    let commands = ctx.register(addr);
    let piece_count = ctx.descriptor.piece_count();
    let mut session = Session {
        ctx,
        conn,
        state: PeerState::new(piece_count),
        upload_permit: None,
        last_sent: Instant::now(),
    };

    let reason = match session.drive(commands).await {
        Ok(reason) => reason,
        Err(e) => CloseReason::from(e),
    };
    session.finish(reason.clone());

    SessionReport {
        addr,
        reason,
        connected: true,
    }
}

struct Session {
    ctx: Arc<SwarmContext>,
    conn: PeerConnection<TcpStream>,
    state: PeerState,
    /// Held while the peer is unchoked for upload.
    upload_permit: Option<OwnedSemaphorePermit>,
    last_sent: Instant,
}

impl Session {
    fn addr(&self) -> SocketAddr {
        self.conn.addr
    }

    async fn drive(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Result<CloseReason, PeerError> {
        let have = self.ctx.have();
        if !have.is_empty() {
            self.send(Message::Bitfield(have.to_bytes())).await?;
        }

        let mut tick = interval(self.ctx.config.housekeeping_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            let idle_deadline = tokio::time::Instant::from_std(
                self.state.last_activity + self.ctx.config.idle_timeout,
            );

            tokio::select! {
                command = commands.recv() => match command {
                    Some(PeerCommand::Close(reason)) => return Ok(reason),
                    Some(command) => self.handle_command(command).await?,
                    None => return Ok(CloseReason::Shutdown),
                },
                message = self.conn.receive() => {
                    self.state.last_activity = Instant::now();
                    self.handle_message(message?).await?;
                }
                _ = sleep_until(idle_deadline) => {
                    debug!("{}: idle for {:?}", self.addr(), self.ctx.config.idle_timeout);
                    return Ok(CloseReason::Timeout);
                }
                _ = tick.tick() => self.housekeeping().await?,
            }
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), PeerError> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.state.choking.peer_choking = true;
                self.release_outstanding();
            }
            Message::Unchoke => {
                self.state.choking.peer_choking = false;
                self.fill_requests().await?;
            }
            Message::Interested => {
                self.state.choking.peer_interested = true;
                self.consider_unchoke().await?;
            }
            Message::NotInterested => {
                self.state.choking.peer_interested = false;
                self.choke_peer().await?;
            }
            Message::Have { piece } => {
                if piece as usize >= self.state.remote.len() {
                    return Err(PeerError::ProtocolViolation(format!(
                        "have for piece {} of {}",
                        piece,
                        self.state.remote.len()
                    )));
                }
                if self.state.remote.set(piece as usize) {
                    self.ctx.scheduler.lock().peer_has(piece);
                }
                self.update_interest().await?;
                self.fill_requests().await?;
            }
            Message::Bitfield(payload) => {
                let remote = Bitfield::from_payload(&payload, self.state.remote.len())?;
                {
                    let mut scheduler = self.ctx.scheduler.lock();
                    scheduler.remove_availability(&self.state.remote);
                    scheduler.add_availability(&remote);
                }
                self.state.remote = remote;
                self.update_interest().await?;
                self.fill_requests().await?;
            }
            Message::Request {
                index,
                begin,
                length,
            } => self.serve(index, begin, length).await?,
            Message::Piece { index, begin, data } => {
                let block = Block::new(index, begin, data);
                if self.state.outstanding.remove(&block.request()) {
                    self.state.last_block_at = Instant::now();
                }
                self.state.bytes_downloaded += block.data.len() as u64;

                self.ctx.on_block(self.addr(), block).await;
                self.update_interest().await?;
                self.fill_requests().await?;
            }
            // requests are answered as they arrive, so there is nothing
            // queued to withdraw
            Message::Cancel { .. } => {}
            Message::Unknown { id } => trace!("{}: ignoring message id {}", self.addr(), id),
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: PeerCommand) -> Result<(), PeerError> {
        match command {
            PeerCommand::Have(piece) => {
                self.send(Message::Have { piece }).await?;
                self.update_interest().await?;
            }
            PeerCommand::Cancel(request) => {
                if self.state.outstanding.remove(&request) {
                    self.send(Message::Cancel {
                        index: request.piece,
                        begin: request.offset,
                        length: request.length,
                    })
                    .await?;
                }
            }
            PeerCommand::Close(_) => {}
        }
        Ok(())
    }

    async fn housekeeping(&mut self) -> Result<(), PeerError> {
        if !self.state.outstanding.is_empty()
            && self.state.last_block_at.elapsed() >= self.ctx.config.request_timeout
        {
            debug!(
                "{}: no block for {:?} with {} requests pending",
                self.addr(),
                self.ctx.config.request_timeout,
                self.state.outstanding.len()
            );
            return Err(PeerError::Timeout);
        }

        if self.last_sent.elapsed() >= self.ctx.config.keepalive_interval {
            self.send(Message::KeepAlive).await?;
        }

        // blocks released by other peers may now be assignable here
        self.update_interest().await?;
        self.fill_requests().await
    }

    async fn update_interest(&mut self) -> Result<(), PeerError> {
        let interesting = self.ctx.scheduler.lock().is_interesting(&self.state.remote);
        if interesting == self.state.choking.am_interested {
            return Ok(());
        }

        self.state.choking.am_interested = interesting;
        if interesting {
            self.send(Message::Interested).await
        } else {
            self.send(Message::NotInterested).await
        }
    }

    async fn fill_requests(&mut self) -> Result<(), PeerError> {
        let max_in_flight = self.ctx.config.max_in_flight;
        if !self.state.can_request() || self.state.spare_capacity(max_in_flight) == 0 {
            return Ok(());
        }

        let requests = self.ctx.scheduler.lock().next_requests(
            self.addr(),
            &self.state.remote,
            self.state.outstanding.len(),
            max_in_flight,
        );
        if requests.is_empty() {
            return Ok(());
        }
        if self.state.outstanding.is_empty() {
            self.state.last_block_at = Instant::now();
        }

        trace!("{}: requesting {} blocks", self.addr(), requests.len());
        for request in &requests {
            self.state.outstanding.insert(*request);
        }
        for request in requests {
            self.send(request_message(&request)).await?;
        }
        Ok(())
    }

    fn release_outstanding(&mut self) {
        let requests = self.state.take_outstanding();
        if !requests.is_empty() {
            trace!("{}: choked with {} requests pending", self.addr(), requests.len());
            self.ctx.scheduler.lock().release(self.addr(), &requests);
        }
    }

    async fn consider_unchoke(&mut self) -> Result<(), PeerError> {
        if !self.state.choking.am_choking {
            return Ok(());
        }
        if let Some(permit) = self.ctx.try_upload_slot() {
            self.upload_permit = Some(permit);
            self.state.choking.am_choking = false;
            self.send(Message::Unchoke).await?;
        }
        Ok(())
    }

    async fn choke_peer(&mut self) -> Result<(), PeerError> {
        if self.state.choking.am_choking {
            return Ok(());
        }
        self.upload_permit = None;
        self.state.choking.am_choking = true;
        self.send(Message::Choke).await
    }

    async fn serve(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        if self.state.choking.am_choking
            || length == 0
            || length > MAX_REQUEST_LENGTH
            || !self.ctx.has_piece(index)
        {
            trace!("{}: not serving {}:{}+{}", self.addr(), index, begin, length);
            return Ok(());
        }

        if let Some(data) = self.ctx.read_block(index, begin, length).await {
            self.state.bytes_uploaded += data.len() as u64;
            self.send(Message::Piece { index, begin, data }).await?;
        }
        Ok(())
    }

    async fn send(&mut self, message: Message) -> Result<(), PeerError> {
        self.conn.send(&message).await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    /// Gives back everything the session held in shared state.
    fn finish(&mut self, reason: CloseReason) {
        let addr = self.addr();
        self.ctx.unregister(addr);

        let outstanding = self.state.take_outstanding();
        self.ctx
            .scheduler
            .lock()
            .remove_peer(addr, &self.state.remote, &outstanding);

        self.upload_permit = None;
        debug!(
            "{}: session over ({}), {} bytes down, {} up",
            addr, reason, self.state.bytes_downloaded, self.state.bytes_uploaded
        );
        self.conn.close(reason);
    }
}

fn request_message(request: &BlockRequest) -> Message {
    Message::Request {
        index: request.piece,
        begin: request.offset,
        length: request.length,
    }
}
