//! Codec engine collaborator.
//!
//! The engine never looks inside media. Output streams hand raw
//! [`MediaFrame`]s to an [`Encoder`] and broadcast the resulting
//! [`EncodedPacket`]s; input streams do the reverse with a [`Decoder`].
//! Both may produce zero or more outputs per input.
//!
//! [`RawCodec`] is the built-in engine: it frames raw samples and pixels
//! without compression.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tracing::debug;

use crate::error::{EngineResult, Error};

/// Kind of media carried by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

/// Audio contract: planar 32-bit float samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioProfile {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in one frame.
    pub frame_samples: u32,
}

impl AudioProfile {
    pub const BYTES_PER_SAMPLE: usize = 4;

    /// Size of one full frame in bytes.
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples as usize * self.bytes_per_tick()
    }

    /// Bytes covering one sample on every channel.
    fn bytes_per_tick(&self) -> usize {
        usize::from(self.channels) * Self::BYTES_PER_SAMPLE
    }

    /// Samples per channel held by `bytes` of audio.
    pub fn samples_in(&self, bytes: usize) -> usize {
        bytes / self.bytes_per_tick().max(1)
    }

    /// Playback duration of `samples` samples per channel.
    pub fn duration_of(&self, samples: usize) -> Duration {
        Duration::from_secs_f64(samples as f64 / f64::from(self.sample_rate.max(1)))
    }
}

/// Video contract: yuv420p frames at a fixed size and rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl VideoProfile {
    /// Size of one yuv420p frame in bytes.
    pub fn frame_bytes(&self) -> usize {
        let pixels = self.width as usize * self.height as usize;
        pixels + pixels / 2
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }
}

/// The audio and video contracts every participant agrees on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profiles {
    pub audio: AudioProfile,
    pub video: VideoProfile,
}

impl Default for Profiles {
    fn default() -> Self {
        Self {
            audio: AudioProfile {
                sample_rate: 48_000,
                channels: 2,
                frame_samples: 1024,
            },
            video: VideoProfile {
                width: 320,
                height: 180,
                fps: 30,
            },
        }
    }
}

/// One-time registration of the media profiles.
#[derive(Debug, Default)]
pub struct MediaProfiles {
    registered: OnceLock<Profiles>,
}

impl MediaProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the default profiles on first call. Idempotent.
    pub fn ensure_initialized(&self) -> &Profiles {
        self.registered.get_or_init(|| {
            let profiles = Profiles::default();
            debug!(
                sample_rate = profiles.audio.sample_rate,
                channels = profiles.audio.channels,
                width = profiles.video.width,
                height = profiles.video.height,
                fps = profiles.video.fps,
                "Media profiles registered"
            );
            profiles
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.registered.get().is_some()
    }
}

/// A raw audio or video frame.
///
/// `data` is reference counted, so cloning a frame for each consumer is
/// cheap and never copies samples.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFrame {
    pub kind: MediaKind,
    /// Presentation timestamp. Output streams stamp milliseconds since the
    /// conference start; input audio counts samples.
    pub pts: i64,
    pub data: Bytes,
}

impl MediaFrame {
    pub fn audio(data: impl Into<Bytes>) -> Self {
        Self {
            kind: MediaKind::Audio,
            pts: 0,
            data: data.into(),
        }
    }

    pub fn video(data: impl Into<Bytes>) -> Self {
        Self {
            kind: MediaKind::Video,
            pts: 0,
            data: data.into(),
        }
    }

    /// Builds an audio frame from one sample buffer per channel.
    pub fn audio_from_planes(planes: &[Vec<f32>]) -> Self {
        let mut data = BytesMut::with_capacity(planes.iter().map(|p| p.len() * 4).sum());
        for plane in planes {
            for sample in plane {
                data.put_f32_le(*sample);
            }
        }
        Self::audio(data.freeze())
    }
}

/// Extra per-packet data (codec parameters and such).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideData {
    pub kind: u32,
    pub data: Bytes,
}

/// Key frame flag in [`EncodedPacket::flags`].
pub const PACKET_FLAG_KEY: i32 = 0x1;

/// One encoded unit, as carried in audio and video messages.
///
/// Serialised layout (little-endian):
/// `[size i32][pts i64][dts i64][flags i32][side_count i32]`
/// then `side_count` times `[kind u32][len u64][bytes]`, then `size` bytes
/// of data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedPacket {
    pub pts: i64,
    pub dts: i64,
    pub flags: i32,
    pub side_data: Vec<SideData>,
    pub data: Bytes,
}

const PACKET_HEADER_SIZE: usize = 4 + 8 + 8 + 4 + 4;

fn need(buf: &[u8], len: usize, what: &str) -> EngineResult<()> {
    if buf.len() < len {
        return Err(Error::invalid_argument(format!(
            "truncated packet {what}: need {len} bytes, {} left",
            buf.len()
        )));
    }
    Ok(())
}

impl EncodedPacket {
    pub fn to_bytes(&self) -> EngineResult<Bytes> {
        let size = i32::try_from(self.data.len())
            .map_err(|_| Error::invalid_argument("packet data exceeds i32::MAX bytes"))?;
        let side_count = i32::try_from(self.side_data.len())
            .map_err(|_| Error::invalid_argument("too many side data entries"))?;
        let side_len: usize = self.side_data.iter().map(|s| 12 + s.data.len()).sum();

        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + side_len + self.data.len());
        buf.put_i32_le(size);
        buf.put_i64_le(self.pts);
        buf.put_i64_le(self.dts);
        buf.put_i32_le(self.flags);
        buf.put_i32_le(side_count);
        for side in &self.side_data {
            buf.put_u32_le(side.kind);
            buf.put_u64_le(side.data.len() as u64);
            buf.put_slice(&side.data);
        }
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Self> {
        let mut buf = bytes;
        need(buf, PACKET_HEADER_SIZE, "header")?;
        let size = buf.get_i32_le();
        let pts = buf.get_i64_le();
        let dts = buf.get_i64_le();
        let flags = buf.get_i32_le();
        let side_count = buf.get_i32_le();
        let size = usize::try_from(size)
            .map_err(|_| Error::invalid_argument(format!("negative packet size {size}")))?;
        let side_count = usize::try_from(side_count)
            .map_err(|_| Error::invalid_argument(format!("negative side data count {side_count}")))?;

        let mut side_data = Vec::new();
        side_data.try_reserve(side_count.min(buf.len() / 12))?;
        for _ in 0..side_count {
            need(buf, 12, "side data header")?;
            let kind = buf.get_u32_le();
            let len = usize::try_from(buf.get_u64_le())
                .map_err(|_| Error::invalid_argument("side data length overflows"))?;
            need(buf, len, "side data")?;
            side_data.push(SideData {
                kind,
                data: Bytes::copy_from_slice(&buf[..len]),
            });
            buf.advance(len);
        }

        if buf.len() != size {
            return Err(Error::invalid_argument(format!(
                "packet declares {size} data bytes but carries {}",
                buf.len()
            )));
        }
        Ok(Self {
            pts,
            dts,
            flags,
            side_data,
            data: Bytes::copy_from_slice(buf),
        })
    }
}

/// Turns raw frames into packets.
pub trait Encoder: Send {
    fn encode(&mut self, frame: MediaFrame) -> EngineResult<Vec<EncodedPacket>>;
}

/// Turns packets back into raw frames.
pub trait Decoder: Send {
    fn decode(&mut self, packet: EncodedPacket) -> EngineResult<Vec<MediaFrame>>;
}

/// Factory for per-stream encoders and decoders.
pub trait CodecEngine: Send + Sync {
    /// Media contracts the engine encodes to and decodes from.
    fn profiles(&self) -> Profiles;

    fn encoder(&self, kind: MediaKind) -> EngineResult<Box<dyn Encoder>>;

    fn decoder(&self, kind: MediaKind) -> EngineResult<Box<dyn Decoder>>;
}

/// Uncompressed codec engine.
#[derive(Debug, Default)]
pub struct RawCodec {
    profiles: MediaProfiles,
}

impl RawCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CodecEngine for RawCodec {
    fn profiles(&self) -> Profiles {
        *self.profiles.ensure_initialized()
    }

    fn encoder(&self, kind: MediaKind) -> EngineResult<Box<dyn Encoder>> {
        Ok(Box::new(RawEncoder {
            kind,
            profiles: self.profiles(),
            pipeline: None,
        }))
    }

    fn decoder(&self, kind: MediaKind) -> EngineResult<Box<dyn Decoder>> {
        Ok(Box::new(RawDecoder {
            kind,
            profiles: self.profiles(),
        }))
    }
}

/// Checks a raw buffer against the profile of its kind.
fn check_frame(kind: MediaKind, profiles: &Profiles, len: usize) -> EngineResult<()> {
    match kind {
        MediaKind::Audio => {
            let tick = usize::from(profiles.audio.channels) * AudioProfile::BYTES_PER_SAMPLE;
            if len == 0 || len % tick != 0 {
                return Err(Error::invalid_argument(format!(
                    "audio frame of {len} bytes is not a whole number of {}-channel samples",
                    profiles.audio.channels
                )));
            }
        }
        MediaKind::Video => {
            let expected = profiles.video.frame_bytes();
            if len != expected {
                return Err(Error::invalid_argument(format!(
                    "video frame of {len} bytes, expected {expected}"
                )));
            }
        }
    }
    Ok(())
}

/// Set up on the first frame.
#[derive(Debug)]
struct Pipeline {
    frames: u64,
}

struct RawEncoder {
    kind: MediaKind,
    profiles: Profiles,
    pipeline: Option<Pipeline>,
}

impl Encoder for RawEncoder {
    fn encode(&mut self, frame: MediaFrame) -> EngineResult<Vec<EncodedPacket>> {
        if frame.kind != self.kind {
            return Err(Error::invalid_argument(format!(
                "{} frame pushed to a {} encoder",
                frame.kind, self.kind
            )));
        }
        check_frame(self.kind, &self.profiles, frame.data.len())?;

        let pipeline = self.pipeline.get_or_insert_with(|| {
            debug!(kind = %frame.kind, "Encoder pipeline initialised");
            Pipeline { frames: 0 }
        });
        let flags = if pipeline.frames == 0 || self.kind == MediaKind::Audio {
            PACKET_FLAG_KEY
        } else {
            0
        };
        pipeline.frames += 1;

        Ok(vec![EncodedPacket {
            pts: frame.pts,
            dts: frame.pts,
            flags,
            side_data: Vec::new(),
            data: frame.data,
        }])
    }
}

struct RawDecoder {
    kind: MediaKind,
    profiles: Profiles,
}

impl Decoder for RawDecoder {
    fn decode(&mut self, packet: EncodedPacket) -> EngineResult<Vec<MediaFrame>> {
        check_frame(self.kind, &self.profiles, packet.data.len())?;
        Ok(vec![MediaFrame {
            kind: self.kind,
            pts: packet.pts,
            data: packet.data,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_frame() -> MediaFrame {
        let profile = Profiles::default().audio;
        MediaFrame::audio(vec![0u8; profile.frame_bytes()])
    }

    #[test]
    fn default_profiles() {
        let profiles = Profiles::default();
        assert_eq!(profiles.audio.frame_bytes(), 1024 * 2 * 4);
        assert_eq!(profiles.video.frame_bytes(), 320 * 180 * 3 / 2);
        assert_eq!(profiles.video.frame_interval(), Duration::from_secs(1) / 30);
        assert_eq!(profiles.audio.samples_in(profiles.audio.frame_bytes()), 1024);
    }

    #[test]
    fn profiles_register_once() {
        let profiles = MediaProfiles::new();
        assert!(!profiles.is_initialized());
        let first: *const Profiles = profiles.ensure_initialized();
        let second: *const Profiles = profiles.ensure_initialized();
        assert!(profiles.is_initialized());
        assert_eq!(first, second);
    }

    #[test]
    fn packet_layout() {
        let packet = EncodedPacket {
            pts: 1,
            dts: 2,
            flags: PACKET_FLAG_KEY,
            side_data: vec![SideData {
                kind: 9,
                data: Bytes::from_static(b"xy"),
            }],
            data: Bytes::from_static(b"abc"),
        };
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE + 12 + 2 + 3);
        assert_eq!(&bytes[..4], &3i32.to_le_bytes());
        assert_eq!(&bytes[bytes.len() - 3..], b"abc");
        assert_eq!(EncodedPacket::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn packet_rejects_size_mismatch() {
        let mut bytes = EncodedPacket {
            data: Bytes::from_static(b"abcd"),
            ..Default::default()
        }
        .to_bytes()
        .unwrap()
        .to_vec();
        bytes.pop();
        assert!(EncodedPacket::from_bytes(&bytes).is_err());
        assert!(EncodedPacket::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn raw_codec_passes_audio_through() {
        let codec = RawCodec::new();
        let mut encoder = codec.encoder(MediaKind::Audio).unwrap();
        let mut decoder = codec.decoder(MediaKind::Audio).unwrap();

        let mut frame = audio_frame();
        frame.pts = 40;
        let packets = encoder.encode(frame.clone()).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].flags, PACKET_FLAG_KEY);

        let frames = decoder.decode(packets[0].clone()).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn raw_codec_validates_frames() {
        let codec = RawCodec::new();
        let mut video = codec.encoder(MediaKind::Video).unwrap();
        assert!(video.encode(MediaFrame::video(vec![0u8; 10])).is_err());
        assert!(video.encode(audio_frame()).is_err());

        let mut audio = codec.encoder(MediaKind::Audio).unwrap();
        assert!(audio.encode(MediaFrame::audio(vec![0u8; 7])).is_err());
        assert!(audio.encode(MediaFrame::audio(Bytes::new())).is_err());
    }

    #[test]
    fn only_first_video_packet_is_key() {
        let codec = RawCodec::new();
        let mut encoder = codec.encoder(MediaKind::Video).unwrap();
        let frame = MediaFrame::video(vec![0u8; codec.profiles().video.frame_bytes()]);
        let first = encoder.encode(frame.clone()).unwrap();
        let second = encoder.encode(frame).unwrap();
        assert_eq!(first[0].flags, PACKET_FLAG_KEY);
        assert_eq!(second[0].flags, 0);
    }

    #[test]
    fn planes_are_laid_out_one_after_another() {
        let frame = MediaFrame::audio_from_planes(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(frame.data.len(), 16);
        assert_eq!(&frame.data[8..12], &3.0f32.to_le_bytes());
    }
}
