//! Envelope and Timestamp wire types.
//!
//! Protobuf layout:
//!   Timestamp { seconds = 1, microseconds = 2 }
//!   Envelope  { dataType = 1, serializedData = 2, sent = 3, received = 4,
//!               sampleTimeStamp = 5, senderStamp = 6 }

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use prost::Message;
use tokio_util::codec::Encoder;

use crate::codec::EnvelopeCodec;
use crate::ProtocolError;

/// Wall-clock time point with microsecond resolution.
#[derive(Clone, Copy, PartialEq, Eq, Hash, prost::Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    /// Always in `0..=999_999`.
    #[prost(int32, tag = "2")]
    pub microseconds: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, microseconds: i32) -> Self {
        Self {
            seconds,
            microseconds,
        }
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self {
            seconds: at.timestamp(),
            microseconds: at.timestamp_subsec_micros() as i32,
        }
    }

    /// Derived instant `seconds + microseconds / 1e6`.
    ///
    /// Falls back to the Unix epoch when the value is out of chrono's range
    /// or `microseconds` is outside `0..=999_999`.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let micros = u32::try_from(self.microseconds)
            .ok()
            .filter(|us| *us < 1_000_000);
        micros
            .and_then(|us| DateTime::from_timestamp(self.seconds, us * 1_000))
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Microseconds since the epoch, saturating at the `i64` bounds.
    pub fn to_micros(&self) -> i64 {
        self.seconds
            .saturating_mul(1_000_000)
            .saturating_add(i64::from(self.microseconds))
    }

    pub fn is_zero(&self) -> bool {
        self.seconds == 0 && self.microseconds == 0
    }
}

/// One application message wrapped with its type tag and timestamps.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    /// Identifier of the payload schema.
    #[prost(uint32, tag = "1")]
    pub data_type: u32,
    /// Complete encoding of exactly one application message.
    #[prost(bytes = "vec", tag = "2")]
    pub serialized_data: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub sent: Option<Timestamp>,
    /// Set by the receiving side; senders leave it empty.
    #[prost(message, optional, tag = "4")]
    pub received: Option<Timestamp>,
    #[prost(message, optional, tag = "5")]
    pub sample_time_stamp: Option<Timestamp>,
    #[prost(uint32, tag = "6")]
    pub sender_stamp: u32,
}

impl Envelope {
    /// `[sent, received, sampleTimeStamp]`, with missing fields as zero.
    pub fn timestamps(&self) -> [Timestamp; 3] {
        [
            self.sent.unwrap_or_default(),
            self.received.unwrap_or_default(),
            self.sample_time_stamp.unwrap_or_default(),
        ]
    }

    /// Decode `serialized_data` as the application message `T`.
    pub fn payload<T: Message + Default>(&self) -> Result<T, ProtocolError> {
        Ok(T::decode(self.serialized_data.as_slice())?)
    }
}

/// Build a complete frame (header + envelope) stamped with `now`.
///
/// `sent` and `sampleTimeStamp` are both set to `now`.
pub fn encode(data_type: u32, payload: &[u8], now: Timestamp) -> Result<Bytes, ProtocolError> {
    encode_with(data_type, payload, now, Timestamp::default(), 0)
}

/// Like [`encode`] with an explicit sample time stamp and sender stamp.
///
/// A zero `sample` defaults to `sent`.
pub fn encode_with(
    data_type: u32,
    payload: &[u8],
    sent: Timestamp,
    sample: Timestamp,
    sender_stamp: u32,
) -> Result<Bytes, ProtocolError> {
    let envelope = Envelope {
        data_type,
        serialized_data: payload.to_vec(),
        sent: Some(sent),
        received: None,
        sample_time_stamp: Some(if sample.is_zero() { sent } else { sample }),
        sender_stamp,
    };

    let mut dst = BytesMut::new();
    EnvelopeCodec.encode(&envelope, &mut dst)?;
    Ok(dst.freeze())
}

/// Parse one frame body (without header) into an Envelope.
pub fn decode(body: &[u8]) -> Result<Envelope, ProtocolError> {
    Ok(Envelope::decode(body)?)
}
