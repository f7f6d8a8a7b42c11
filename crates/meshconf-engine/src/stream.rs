//! Media streams and their worker threads.
//!
//! Every [`Stream`] owns a FIFO queue and one worker thread. Input streams
//! carry encoded packets from a remote participant through a decoder to the
//! application; output streams carry raw frames from the application through
//! an encoder to every peer.
//!
//! Closing a stream marks its queue closed, drops whatever is still queued,
//! wakes the worker and joins it. Only then is the stream released.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, warn};

use meshconf_core::{FramePacer, Timestamp, elapsed_since};
use meshconf_protocol::ParticipantId;

use crate::codec::{CodecEngine, EncodedPacket, MediaFrame, MediaKind};
use crate::error::{EngineResult, Error};
use crate::sync::{lock, read, write};

/// Which way media flows through a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Remote packets decoded for the application.
    Input,
    /// Local frames encoded for the peers.
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
        })
    }
}

/// Identifier of a stream within one conference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct StreamId(u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receives decoded frames: `(participant, kind, frame)`.
pub type FrameSink = Arc<dyn Fn(ParticipantId, MediaKind, MediaFrame) + Send + Sync>;

/// Receives packets encoded by an output stream.
pub type PacketSink = Arc<dyn Fn(&Stream, EncodedPacket) + Send + Sync>;

/// Everything a worker needs besides its own stream.
#[derive(Clone)]
pub struct StreamEnv {
    pub codec: Arc<dyn CodecEngine>,
    pub on_frame: FrameSink,
    pub on_packet: PacketSink,
    /// Conference start, origin of output timestamps.
    pub start_ts: Arc<AtomicU64>,
}

enum Unit {
    Packet(EncodedPacket),
    Frame(MediaFrame),
}

#[derive(Default)]
struct Queue {
    units: VecDeque<Unit>,
    closed: bool,
}

/// One media stream.
pub struct Stream {
    id: StreamId,
    participant_id: ParticipantId,
    kind: MediaKind,
    direction: Direction,
    queue: Mutex<Queue>,
    ready: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("participant_id", &self.participant_id)
            .field("kind", &self.kind)
            .field("direction", &self.direction)
            .finish()
    }
}

impl Stream {
    fn new(id: StreamId, participant_id: ParticipantId, kind: MediaKind, direction: Direction) -> Self {
        Self {
            id,
            participant_id,
            kind,
            direction,
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Units waiting for the worker.
    pub fn queued(&self) -> usize {
        lock(&self.queue).units.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.queue).closed
    }

    fn push(&self, unit: Unit) -> EngineResult<()> {
        let mut queue = lock(&self.queue);
        if queue.closed {
            return Err(Error::invalid_stream(format!("stream {} is closed", self.id)));
        }
        queue.units.try_reserve(1)?;
        queue.units.push_back(unit);
        drop(queue);
        self.ready.notify_one();
        Ok(())
    }

    /// Blocks until a unit is available. `None` once the stream is closed.
    fn pop(&self) -> Option<Unit> {
        let mut queue = lock(&self.queue);
        loop {
            if queue.closed {
                return None;
            }
            if let Some(unit) = queue.units.pop_front() {
                return Some(unit);
            }
            queue = self
                .ready
                .wait(queue)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Discards queued units, stops the worker and waits for it.
    ///
    /// Called from the worker itself (through a sink), the join is skipped:
    /// the worker sees the closed flag as soon as it returns to its queue.
    fn close(&self) {
        {
            let mut queue = lock(&self.queue);
            queue.closed = true;
            queue.units.clear();
        }
        self.ready.notify_all();

        let Some(handle) = lock(&self.worker).take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!(stream = %self.id, "Stream worker panicked");
        }
        debug!(stream = %self.id, kind = %self.kind, direction = %self.direction, "Stream closed");
    }

    fn run_input(&self, env: &StreamEnv) {
        let mut decoder = match env.codec.decoder(self.kind) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!(stream = %self.id, error = %e, "Failed to create decoder");
                return;
            }
        };
        let audio = env.codec.profiles().audio;
        // input audio timestamps count samples
        let mut samples: i64 = 0;

        while let Some(unit) = self.pop() {
            let Unit::Packet(packet) = unit else {
                continue;
            };
            match decoder.decode(packet) {
                Ok(frames) => {
                    for mut frame in frames {
                        if self.kind == MediaKind::Audio {
                            frame.pts = samples;
                            samples += audio.samples_in(frame.data.len()) as i64;
                        }
                        (env.on_frame)(self.participant_id, self.kind, frame);
                    }
                }
                Err(e) => warn!(stream = %self.id, error = %e, "Dropping undecodable packet"),
            }
        }
    }

    fn run_output(&self, env: &StreamEnv) {
        let mut encoder = match env.codec.encoder(self.kind) {
            Ok(encoder) => encoder,
            Err(e) => {
                warn!(stream = %self.id, error = %e, "Failed to create encoder");
                return;
            }
        };
        let profiles = env.codec.profiles();
        let mut pacer = FramePacer::new();

        while let Some(unit) = self.pop() {
            let Unit::Frame(mut frame) = unit else {
                continue;
            };
            let expected = match self.kind {
                MediaKind::Audio => profiles
                    .audio
                    .duration_of(profiles.audio.samples_in(frame.data.len())),
                MediaKind::Video => profiles.video.frame_interval(),
            };
            pacer.pace(expected);

            let start: Timestamp = env.start_ts.load(Ordering::Acquire);
            frame.pts = i64::try_from(elapsed_since(start).as_millis()).unwrap_or(i64::MAX);
            match encoder.encode(frame) {
                Ok(packets) => {
                    for packet in packets {
                        (env.on_packet)(self, packet);
                    }
                }
                Err(e) => warn!(stream = %self.id, error = %e, "Dropping unencodable frame"),
            }
        }
    }
}

/// Serialisable view of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub id: StreamId,
    pub participant_id: ParticipantId,
    pub kind: MediaKind,
    pub direction: Direction,
    pub queued: usize,
}

/// Input and output streams of one conference, each list behind its own
/// lock.
pub struct StreamContainer {
    inputs: RwLock<Vec<Arc<Stream>>>,
    outputs: RwLock<Vec<Arc<Stream>>>,
    next_id: AtomicU64,
    env: StreamEnv,
}

impl StreamContainer {
    pub fn new(env: StreamEnv) -> Self {
        Self {
            inputs: RwLock::new(Vec::new()),
            outputs: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            env,
        }
    }

    fn list(&self, direction: Direction) -> &RwLock<Vec<Arc<Stream>>> {
        match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        }
    }

    /// Opens a stream and starts its worker.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidStream`] if the participant already has a stream of
    /// that kind and direction, [`Error::Memory`] or [`Error::Threading`]
    /// if resources run out. Nothing is left half-registered on failure.
    pub fn open(
        &self,
        participant_id: ParticipantId,
        kind: MediaKind,
        direction: Direction,
    ) -> EngineResult<Arc<Stream>> {
        let mut list = write(self.list(direction));
        if list
            .iter()
            .any(|s| s.participant_id == participant_id && s.kind == kind)
        {
            return Err(Error::invalid_stream(format!(
                "{kind} {direction} stream for {participant_id:016x} already open"
            )));
        }
        list.try_reserve(1)?;

        let id = StreamId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let stream = Arc::new(Stream::new(id, participant_id, kind, direction));
        let worker_stream = Arc::clone(&stream);
        let env = self.env.clone();
        let handle = thread::Builder::new()
            .name("meshconf-stream".to_string())
            .spawn(move || match worker_stream.direction {
                Direction::Input => worker_stream.run_input(&env),
                Direction::Output => worker_stream.run_output(&env),
            })
            .map_err(|e| Error::Threading(e.to_string()))?;
        *lock(&stream.worker) = Some(handle);

        list.push(Arc::clone(&stream));
        debug!(stream = %id, participant = %format_args!("{participant_id:016x}"), %kind, %direction, "Stream opened");
        Ok(stream)
    }

    pub fn find(
        &self,
        participant_id: ParticipantId,
        kind: MediaKind,
        direction: Direction,
    ) -> Option<Arc<Stream>> {
        read(self.list(direction))
            .iter()
            .find(|s| s.participant_id == participant_id && s.kind == kind)
            .cloned()
    }

    /// Queues a raw frame on an output stream.
    pub fn push_frame(&self, id: StreamId, frame: MediaFrame) -> EngineResult<()> {
        let stream = read(&self.outputs)
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| Error::invalid_stream(format!("no output stream {id}")))?;
        if stream.kind != frame.kind {
            return Err(Error::invalid_stream(format!(
                "{} frame pushed to {} stream {id}",
                frame.kind, stream.kind
            )));
        }
        stream.push(Unit::Frame(frame))
    }

    /// Queues a packet on the input stream of `participant_id`.
    pub fn push_packet(
        &self,
        participant_id: ParticipantId,
        kind: MediaKind,
        packet: EncodedPacket,
    ) -> EngineResult<()> {
        let stream = self
            .find(participant_id, kind, Direction::Input)
            .ok_or_else(|| {
                Error::invalid_stream(format!("no {kind} input for {participant_id:016x}"))
            })?;
        stream.push(Unit::Packet(packet))
    }

    /// Closes one stream.
    pub fn close(&self, id: StreamId) -> EngineResult<()> {
        let removed = [Direction::Input, Direction::Output]
            .into_iter()
            .find_map(|direction| {
                let mut list = write(self.list(direction));
                let index = list.iter().position(|s| s.id == id)?;
                Some(list.remove(index))
            })
            .ok_or_else(|| Error::invalid_stream(format!("no stream {id}")))?;
        removed.close();
        Ok(())
    }

    /// Closes every stream owned by `participant_id`. Returns how many.
    pub fn close_all(&self, participant_id: ParticipantId) -> usize {
        let mut removed = Vec::new();
        for direction in [Direction::Input, Direction::Output] {
            let mut list = write(self.list(direction));
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *list)
                .into_iter()
                .partition(|s| s.participant_id == participant_id);
            *list = kept;
            removed.extend(gone);
        }
        // join outside the container locks
        for stream in &removed {
            stream.close();
        }
        removed.len()
    }

    /// Closes every stream.
    pub fn close_everything(&self) {
        let mut removed = std::mem::take(&mut *write(&self.inputs));
        removed.append(&mut std::mem::take(&mut *write(&self.outputs)));
        for stream in &removed {
            stream.close();
        }
    }

    pub fn len(&self) -> usize {
        read(&self.inputs).len() + read(&self.outputs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<StreamSummary> {
        let inputs = read(&self.inputs);
        let outputs = read(&self.outputs);
        inputs
            .iter()
            .chain(outputs.iter())
            .map(|s| StreamSummary {
                id: s.id,
                participant_id: s.participant_id,
                kind: s.kind,
                direction: s.direction,
                queued: s.queued(),
            })
            .collect()
    }
}

impl Drop for StreamContainer {
    fn drop(&mut self) {
        self.close_everything();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Profiles, RawCodec};
    use std::sync::mpsc;
    use std::time::Duration;

    fn env_with(
        on_frame: FrameSink,
        on_packet: PacketSink,
    ) -> StreamEnv {
        StreamEnv {
            codec: Arc::new(RawCodec::new()),
            on_frame,
            on_packet,
            start_ts: Arc::new(AtomicU64::new(meshconf_core::now_timestamp())),
        }
    }

    fn audio_packet() -> EncodedPacket {
        EncodedPacket {
            data: vec![0u8; Profiles::default().audio.frame_bytes()].into(),
            ..Default::default()
        }
    }

    fn audio_frame() -> MediaFrame {
        MediaFrame::audio(vec![0u8; Profiles::default().audio.frame_bytes()])
    }

    #[test]
    fn input_stream_delivers_frames_with_sample_pts() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let container = StreamContainer::new(env_with(
            Arc::new(move |id, kind, frame: MediaFrame| {
                let _ = lock(&tx).send((id, kind, frame.pts));
            }),
            Arc::new(|_, _| {}),
        ));
        container.open(7, MediaKind::Audio, Direction::Input).unwrap();
        container.push_packet(7, MediaKind::Audio, audio_packet()).unwrap();
        container.push_packet(7, MediaKind::Audio, audio_packet()).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, (7, MediaKind::Audio, 0));
        assert_eq!(second, (7, MediaKind::Audio, 1024));
    }

    #[test]
    fn output_stream_emits_packets() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let container = StreamContainer::new(env_with(
            Arc::new(|_, _, _| {}),
            Arc::new(move |stream: &Stream, packet: EncodedPacket| {
                let _ = lock(&tx).send((stream.participant_id(), packet.pts, packet.data.len()));
            }),
        ));
        let stream = container.open(1, MediaKind::Audio, Direction::Output).unwrap();
        container.push_frame(stream.id(), audio_frame()).unwrap();

        let (owner, pts, len) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(owner, 1);
        assert!(pts >= 0);
        assert_eq!(len, Profiles::default().audio.frame_bytes());
    }

    #[test]
    fn duplicate_open_is_rejected() {
        let container = StreamContainer::new(env_with(Arc::new(|_, _, _| {}), Arc::new(|_, _| {})));
        container.open(1, MediaKind::Video, Direction::Input).unwrap();
        assert!(matches!(
            container.open(1, MediaKind::Video, Direction::Input),
            Err(Error::InvalidStream(_))
        ));
        container.open(1, MediaKind::Audio, Direction::Input).unwrap();
        assert_eq!(container.len(), 2);
    }

    #[test]
    fn push_to_missing_or_closed_stream_fails() {
        let container = StreamContainer::new(env_with(Arc::new(|_, _, _| {}), Arc::new(|_, _| {})));
        assert!(matches!(
            container.push_packet(3, MediaKind::Audio, audio_packet()),
            Err(Error::InvalidStream(_))
        ));

        let stream = container.open(3, MediaKind::Audio, Direction::Output).unwrap();
        assert!(matches!(
            container.push_frame(stream.id(), MediaFrame::video(vec![0u8; 4])),
            Err(Error::InvalidStream(_))
        ));
        container.close(stream.id()).unwrap();
        assert!(stream.is_closed());
        assert!(matches!(
            container.push_frame(stream.id(), audio_frame()),
            Err(Error::InvalidStream(_))
        ));
        assert!(matches!(container.close(stream.id()), Err(Error::InvalidStream(_))));
    }

    #[test]
    fn close_all_only_touches_owner() {
        let container = StreamContainer::new(env_with(Arc::new(|_, _, _| {}), Arc::new(|_, _| {})));
        container.open(1, MediaKind::Audio, Direction::Input).unwrap();
        container.open(1, MediaKind::Video, Direction::Input).unwrap();
        container.open(2, MediaKind::Audio, Direction::Input).unwrap();
        assert_eq!(container.close_all(1), 2);
        assert!(container.find(1, MediaKind::Audio, Direction::Input).is_none());
        assert!(container.find(2, MediaKind::Audio, Direction::Input).is_some());
    }

    #[test]
    fn stress_close_while_busy() {
        let container = StreamContainer::new(env_with(
            Arc::new(|_, _, _| thread::sleep(Duration::from_millis(1))),
            Arc::new(|_, _| {}),
        ));
        for round in 0..50 {
            let stream = container.open(round, MediaKind::Audio, Direction::Input).unwrap();
            for _ in 0..20 {
                container.push_packet(round, MediaKind::Audio, audio_packet()).unwrap();
            }
            container.close(stream.id()).unwrap();
            assert!(lock(&stream.worker).is_none());
            assert_eq!(stream.queued(), 0);
        }
        assert!(container.is_empty());
    }

    #[test]
    fn worker_may_close_its_own_stream() {
        let (tx, rx) = mpsc::channel::<()>();
        let tx = Mutex::new(tx);
        let container: Arc<StreamContainer> = Arc::new_cyclic(|weak: &std::sync::Weak<StreamContainer>| {
            let weak = weak.clone();
            StreamContainer::new(env_with(
                Arc::new(move |id, _, _| {
                    if let Some(container) = weak.upgrade() {
                        container.close_all(id);
                    }
                    let _ = lock(&tx).send(());
                }),
                Arc::new(|_, _| {}),
            ))
        });
        container.open(9, MediaKind::Audio, Direction::Input).unwrap();
        container.push_packet(9, MediaKind::Audio, audio_packet()).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(container.find(9, MediaKind::Audio, Direction::Input).is_none());
    }

    #[test]
    fn snapshot_lists_streams() {
        let container = StreamContainer::new(env_with(Arc::new(|_, _, _| {}), Arc::new(|_, _| {})));
        container.open(5, MediaKind::Video, Direction::Output).unwrap();
        let snapshot = container.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].direction, Direction::Output);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json[0]["kind"], "video");
        assert_eq!(json[0]["direction"], "output");
    }
}
