//! WallClock protocol packet.
//!
//! ```text
//!  0        1        2        3
//! +--------+--------+--------+--------+
//! |version | type   |precisn |reserved|
//! +--------+--------+--------+--------+
//! |        max frequency error        |   1/256 ppm
//! +-----------------------------------+
//! | originate sec   | originate nsec  |
//! | receive sec     | receive nsec    |
//! | transmit sec    | transmit nsec   |
//! +-----------------------------------+
//! ```
//! All fields big-endian, 32 bytes total.

use crate::error::MessageError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

pub const WC_MESSAGE_SIZE: usize = 32;
pub const WC_PROTOCOL_VERSION: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcMessageType {
    Request = 0,
    Response = 1,
    ResponseWithFollowUp = 2,
    FollowUp = 3,
}

impl WcMessageType {
    pub fn from_u8(v: u8) -> Result<Self, MessageError> {
        match v {
            0 => Ok(WcMessageType::Request),
            1 => Ok(WcMessageType::Response),
            2 => Ok(WcMessageType::ResponseWithFollowUp),
            3 => Ok(WcMessageType::FollowUp),
            other => Err(MessageError::UnknownMessageType(other)),
        }
    }

    pub fn is_response(self) -> bool {
        !matches!(self, WcMessageType::Request)
    }
}

/// Seconds and nanoseconds of WallClock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WcTimestamp {
    pub secs: u32,
    pub nanos: u32,
}

impl WcTimestamp {
    /// Negative times are clamped to zero; the wire format is unsigned.
    pub fn from_nanos(nanos: i64) -> Self {
        let n = nanos.max(0) as u64;
        WcTimestamp {
            secs: (n / 1_000_000_000) as u32,
            nanos: (n % 1_000_000_000) as u32,
        }
    }

    pub fn to_nanos(self) -> i64 {
        self.secs as i64 * 1_000_000_000 + self.nanos as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WcMessage {
    pub version: u8,
    pub message_type: WcMessageType,
    /// log2 of the sender's clock precision in seconds.
    pub precision: i8,
    pub reserved: u8,
    /// Units of 1/256 ppm.
    pub max_freq_error: u32,
    pub originate: WcTimestamp,
    pub receive: WcTimestamp,
    pub transmit: WcTimestamp,
}

impl WcMessage {
    pub fn request(originate_nanos: i64, precision_ns: f64, max_freq_error_ppm: f64) -> Self {
        WcMessage {
            version: WC_PROTOCOL_VERSION,
            message_type: WcMessageType::Request,
            precision: encode_precision(precision_ns),
            reserved: 0,
            max_freq_error: encode_max_freq_error(max_freq_error_ppm),
            originate: WcTimestamp::from_nanos(originate_nanos),
            receive: WcTimestamp::default(),
            transmit: WcTimestamp::default(),
        }
    }

    /// Builds the reply a server sends to `request`.
    pub fn response_to(
        request: &WcMessage,
        message_type: WcMessageType,
        receive_nanos: i64,
        transmit_nanos: i64,
        precision_ns: f64,
        max_freq_error_ppm: f64,
    ) -> Self {
        WcMessage {
            version: WC_PROTOCOL_VERSION,
            message_type,
            precision: encode_precision(precision_ns),
            reserved: 0,
            max_freq_error: encode_max_freq_error(max_freq_error_ppm),
            originate: request.originate,
            receive: WcTimestamp::from_nanos(receive_nanos),
            transmit: WcTimestamp::from_nanos(transmit_nanos),
        }
    }

    pub fn precision_nanos(&self) -> f64 {
        decode_precision(self.precision)
    }

    pub fn max_freq_error_ppm(&self) -> f64 {
        self.max_freq_error as f64 / 256.0
    }

    pub fn encode(&self) -> [u8; WC_MESSAGE_SIZE] {
        let mut buf = [0u8; WC_MESSAGE_SIZE];
        // A slice of exactly WC_MESSAGE_SIZE bytes always has room.
        let _ = self.write_fields(&mut &mut buf[..]);
        buf
    }

    fn write_fields<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u8(self.version)?;
        w.write_u8(self.message_type as u8)?;
        w.write_i8(self.precision)?;
        w.write_u8(self.reserved)?;
        w.write_u32::<BigEndian>(self.max_freq_error)?;
        for ts in [self.originate, self.receive, self.transmit] {
            w.write_u32::<BigEndian>(ts.secs)?;
            w.write_u32::<BigEndian>(ts.nanos)?;
        }
        Ok(())
    }

    pub fn parse(buf: &[u8]) -> Result<Self, MessageError> {
        if buf.len() != WC_MESSAGE_SIZE {
            return Err(MessageError::WrongSize { expected: WC_MESSAGE_SIZE, actual: buf.len() });
        }
        if buf[0] != WC_PROTOCOL_VERSION {
            return Err(MessageError::UnsupportedVersion(buf[0]));
        }
        let message_type = WcMessageType::from_u8(buf[1])?;

        let mut r = Cursor::new(&buf[2..]);
        let short = |_| MessageError::WrongSize { expected: WC_MESSAGE_SIZE, actual: buf.len() };
        let precision = r.read_i8().map_err(short)?;
        let reserved = r.read_u8().map_err(short)?;
        let max_freq_error = r.read_u32::<BigEndian>().map_err(short)?;
        let mut times = [WcTimestamp::default(); 3];
        for ts in times.iter_mut() {
            ts.secs = r.read_u32::<BigEndian>().map_err(short)?;
            ts.nanos = r.read_u32::<BigEndian>().map_err(short)?;
        }

        Ok(WcMessage {
            version: buf[0],
            message_type,
            precision,
            reserved,
            max_freq_error,
            originate: times[0],
            receive: times[1],
            transmit: times[2],
        })
    }
}

/// Smallest power-of-two seconds exponent not finer than `precision_ns`.
pub fn encode_precision(precision_ns: f64) -> i8 {
    if precision_ns <= 0.0 {
        return i8::MIN;
    }
    let exp = (precision_ns / 1e9).log2().ceil();
    exp.clamp(i8::MIN as f64, i8::MAX as f64) as i8
}

pub fn decode_precision(precision: i8) -> f64 {
    2f64.powi(precision as i32) * 1e9
}

pub fn encode_max_freq_error(ppm: f64) -> u32 {
    (ppm * 256.0).round().clamp(0.0, u32::MAX as f64) as u32
}
