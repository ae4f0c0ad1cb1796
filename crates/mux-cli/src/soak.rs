//! Loopback soak run.
//!
//! Drives one [`SessionManager`] in both directions over in-memory pipes:
//!
//! - uplink: a producer per session fills the session's input; a pump per
//!   session pulls it with `read_multi_buffer`, so every read goes through
//!   the token scheduler.
//! - downlink: a single dispatcher walks a shuffled wire image of
//!   `[u16 session id][u16 length][payload]` frames, picks each session's
//!   read adapter with `new_reader`, and writes the payload to the session's
//!   output, where a consumer counts it.

use anyhow::{ensure, Context, Result};
use mux_core::{
    encode_chunk, pipe, BufferedReader, Link, MultiBuffer, MuxError, PipeReader, PipeWriter,
    Reader, TransferType, Writer, BUFFER_SIZE,
};
use mux_session::{ManagerConfig, Session, SessionManager};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Multi-buffers each in-memory pipe can hold before the writer waits.
const PIPE_CAPACITY: usize = 16;

/// Resolved shape of a soak run.
#[derive(Debug, Clone)]
pub struct SoakSettings {
    pub sessions: u16,
    pub chunks_per_session: usize,
    pub chunk_size: usize,
    pub transfer: TransferType,
}

impl SoakSettings {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.sessions > 0, "at least one session is required");
        ensure!(
            (1..=usize::from(u16::MAX)).contains(&self.chunk_size),
            "chunk size must be between 1 and {} bytes",
            u16::MAX
        );
        ensure!(
            self.transfer == TransferType::Stream || self.chunk_size <= BUFFER_SIZE,
            "packet chunks must fit in one buffer ({BUFFER_SIZE} bytes), got {}",
            self.chunk_size
        );
        Ok(())
    }
}

/// Per-session byte counts.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionReport {
    pub id: u16,
    pub uplink_bytes: u64,
    pub downlink_bytes: u64,
}

/// Outcome of a soak run.
#[derive(Debug, Serialize)]
pub struct SoakReport {
    pub sessions: u16,
    pub transfer: String,
    pub uplink_bytes: u64,
    pub downlink_bytes: u64,
    pub scan_passes: u64,
    /// Whether the idle-close path succeeded once every session was closed.
    pub idle_closed: bool,
    pub elapsed_ms: u128,
    pub per_session: Vec<SessionReport>,
}

struct Endpoint {
    session: Arc<Session>,
    feed: PipeWriter,
    drain: PipeReader,
}

/// Run the soak and report what went through.
pub async fn run(settings: &SoakSettings, manager_config: ManagerConfig) -> Result<SoakReport> {
    settings.validate()?;
    let started = Instant::now();
    let manager = SessionManager::with_config(manager_config);

    let mut endpoints = Vec::with_capacity(usize::from(settings.sessions));
    for _ in 0..settings.sessions {
        let (input, feed) = pipe(PIPE_CAPACITY);
        let (drain, output) = pipe(PIPE_CAPACITY);
        let session = manager
            .allocate(settings.transfer, Link::new(input, output))
            .await
            .context("session manager closed during setup")?;
        endpoints.push(Endpoint {
            session,
            feed,
            drain,
        });
    }
    info!(
        sessions = settings.sessions,
        transfer = %settings.transfer,
        "sessions allocated"
    );

    let mut per_session: BTreeMap<u16, SessionReport> = endpoints
        .iter()
        .map(|e| {
            let id = e.session.id();
            (
                id,
                SessionReport {
                    id,
                    ..Default::default()
                },
            )
        })
        .collect();

    let sessions: Vec<Arc<Session>> = endpoints.iter().map(|e| Arc::clone(&e.session)).collect();
    let mut consumers = Vec::with_capacity(endpoints.len());

    // Uplink: producers feed inputs, pumps read through the scheduler.
    let (uplink_tx, mut uplink_rx) = mpsc::channel::<(u16, usize)>(256);
    let mut producers: Vec<JoinHandle<Result<()>>> = Vec::with_capacity(endpoints.len());
    let mut pumps: Vec<JoinHandle<Result<()>>> = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let Endpoint {
            session,
            feed,
            drain,
        } = endpoint;

        let payloads = random_payloads(settings.chunks_per_session, settings.chunk_size);
        producers.push(tokio::spawn(produce(feed, payloads)));
        pumps.push(tokio::spawn(pump(session, uplink_tx.clone())));
        consumers.push(tokio::spawn(consume(drain)));
    }
    drop(uplink_tx);

    while let Some((id, n)) = uplink_rx.recv().await {
        if let Some(report) = per_session.get_mut(&id) {
            report.uplink_bytes += n as u64;
        }
    }
    for producer in producers {
        producer.await.context("uplink producer panicked")??;
    }
    for pump in pumps {
        pump.await.context("uplink pump panicked")??;
    }
    debug!("uplink drained");

    // Downlink: demultiplex the wire image into session outputs.
    let ids: Vec<u16> = sessions.iter().map(|s| s.id()).collect();
    let wire = build_wire(&ids, settings.chunks_per_session, settings.chunk_size)?;
    dispatch(&manager, &wire).await?;

    for session in &sessions {
        session.close().await?;
    }
    for (id, consumer) in ids.iter().zip(consumers) {
        let bytes = consumer.await.context("downlink consumer panicked")??;
        if let Some(report) = per_session.get_mut(id) {
            report.downlink_bytes = bytes;
        }
    }
    debug!("downlink drained");

    let idle_closed = manager.close_if_no_session().await;
    let scan_passes = manager.scan_passes();
    manager.close().await?;

    let per_session: Vec<SessionReport> = per_session.into_values().collect();
    let report = SoakReport {
        sessions: settings.sessions,
        transfer: settings.transfer.to_string(),
        uplink_bytes: per_session.iter().map(|r| r.uplink_bytes).sum(),
        downlink_bytes: per_session.iter().map(|r| r.downlink_bytes).sum(),
        scan_passes,
        idle_closed,
        elapsed_ms: started.elapsed().as_millis(),
        per_session,
    };
    info!(
        uplink = report.uplink_bytes,
        downlink = report.downlink_bytes,
        scan_passes = report.scan_passes,
        "soak finished"
    );
    Ok(report)
}

fn random_payloads(count: usize, size: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let mut payload = vec![0u8; size];
            rng.fill(payload.as_mut_slice());
            payload
        })
        .collect()
}

/// Shuffled wire image: each session's chunks interleaved at random.
fn build_wire(ids: &[u16], chunks_per_session: usize, chunk_size: usize) -> Result<Vec<u8>> {
    let mut order: Vec<u16> = ids
        .iter()
        .flat_map(|&id| std::iter::repeat(id).take(chunks_per_session))
        .collect();
    let mut rng = rand::thread_rng();
    order.shuffle(&mut rng);

    let mut wire = Vec::with_capacity(order.len() * (4 + chunk_size));
    let mut payload = vec![0u8; chunk_size];
    for id in order {
        rng.fill(payload.as_mut_slice());
        wire.extend_from_slice(&id.to_be_bytes());
        wire.extend(encode_chunk(&payload)?);
    }
    Ok(wire)
}

async fn produce(mut feed: PipeWriter, payloads: Vec<Vec<u8>>) -> Result<()> {
    for payload in payloads {
        feed.write_multi_buffer(MultiBuffer::from(payload)).await?;
    }
    feed.close().await?;
    Ok(())
}

async fn pump(session: Arc<Session>, uplink: mpsc::Sender<(u16, usize)>) -> Result<()> {
    loop {
        let mb = session.read_multi_buffer().await?;
        if mb.is_empty() {
            return Ok(());
        }
        uplink
            .send((session.id(), mb.len()))
            .await
            .context("uplink collector went away")?;
    }
}

async fn consume(mut drain: PipeReader) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let mb = drain.read_multi_buffer().await?;
        if mb.is_empty() {
            return Ok(total);
        }
        total += mb.len() as u64;
    }
}

async fn dispatch(manager: &SessionManager, wire: &[u8]) -> Result<()> {
    let mut buffered = BufferedReader::new(wire);
    loop {
        let id = match buffered.read_u16().await {
            Ok(id) => id,
            Err(MuxError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let session = manager
            .get(id)
            .await
            .with_context(|| format!("frame for unknown session {id}"))?;

        let mut reader = session.new_reader(&mut buffered);
        loop {
            let mb = reader.read_multi_buffer().await?;
            if mb.is_empty() {
                break;
            }
            session.write_multi_buffer(mb).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(transfer: TransferType, chunk_size: usize) -> SoakSettings {
        SoakSettings {
            sessions: 3,
            chunks_per_session: 5,
            chunk_size,
            transfer,
        }
    }

    #[test]
    fn packet_chunks_must_fit_one_buffer() {
        assert!(settings(TransferType::Packet, BUFFER_SIZE).validate().is_ok());
        assert!(settings(TransferType::Packet, BUFFER_SIZE + 1).validate().is_err());
        assert!(settings(TransferType::Stream, BUFFER_SIZE * 4).validate().is_ok());
        assert!(settings(TransferType::Stream, 0).validate().is_err());
    }

    #[test]
    fn wire_holds_every_chunk() {
        let wire = build_wire(&[1, 2], 3, 10).unwrap();
        // 6 frames of id + length + payload.
        assert_eq!(wire.len(), 6 * (2 + 2 + 10));
    }

    #[tokio::test]
    async fn producer_error_is_reported() {
        let (mut input, feed) = pipe(1);
        input.close().await.unwrap();

        let err = produce(feed, vec![vec![1u8; 8]]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MuxError>(),
            Some(MuxError::PipeClosed)
        ));
    }

    #[tokio::test]
    async fn stream_soak_moves_every_byte() {
        let report = run(&settings(TransferType::Stream, 3000), ManagerConfig::default())
            .await
            .unwrap();

        assert_eq!(report.uplink_bytes, 3 * 5 * 3000);
        assert_eq!(report.downlink_bytes, 3 * 5 * 3000);
        assert!(report.idle_closed);
        for session in &report.per_session {
            assert_eq!(session.uplink_bytes, 5 * 3000);
            assert_eq!(session.downlink_bytes, 5 * 3000);
        }
    }

    #[tokio::test]
    async fn packet_soak_moves_every_byte() {
        let report = run(&settings(TransferType::Packet, 700), ManagerConfig::default())
            .await
            .unwrap();

        assert_eq!(report.uplink_bytes, 3 * 5 * 700);
        assert_eq!(report.downlink_bytes, 3 * 5 * 700);
        assert_eq!(report.per_session.len(), 3);
    }
}
