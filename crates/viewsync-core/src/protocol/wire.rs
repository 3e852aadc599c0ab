//! Binary wire format
//!
//! Frames every [`Message`] for transport over TCP and encodes the UDP
//! discovery announcement. All integers and floats are big-endian.
//!
//! ## Frame Format
//!
//! ```text
//! +----------+----------+--------------------+
//! | length   | kind     | payload            |
//! | (u32 BE) | (1 byte) | (length - 1 bytes) |
//! +----------+----------+--------------------+
//! ```
//!
//! The length covers the kind byte plus the payload. Strings are a u32
//! byte length followed by UTF-8 bytes; binary blobs use the same layout.
//!
//! Frames above [`MAX_FRAME_SIZE`] and payloads that do not parse are
//! errors and tear the connection down. A frame with an unknown kind is
//! skipped with a warning so newer peers can keep talking to older ones.
//!
//! ## Announcement Format
//!
//! ```text
//! +--------+----------+-------------+
//! | magic  | port     | client name |
//! | "VSYN" | (u16 BE) | (string)    |
//! +--------+----------+-------------+
//! ```
//!
//! Datagrams without the magic are ignored without logging; broadcast
//! ports see plenty of foreign noise.

use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::{SyncError, SyncResult};
use crate::protocol::message::{kind, Message};
use crate::types::{PointF, Transform, WindowRect};

/// Upper bound on a single frame, sized for pushed images.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Magic prefix of discovery datagrams.
pub const DISCOVERY_MAGIC: &[u8; 4] = b"VSYN";

const FRAME_HEADER_SIZE: usize = 4;

/// Discovery announcement broadcast over UDP while a server is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// TCP port of the announcing server
    pub server_port: u16,
    /// Instance name of the announcing client
    pub client_name: String,
}

/// Encode a discovery announcement into a datagram.
pub fn encode_announcement(ann: &Announcement) -> Bytes {
    let mut buf = BytesMut::with_capacity(DISCOVERY_MAGIC.len() + 6 + ann.client_name.len());
    buf.put_slice(DISCOVERY_MAGIC);
    buf.put_u16(ann.server_port);
    put_string(&mut buf, &ann.client_name);
    buf.freeze()
}

/// Decode a discovery datagram.
///
/// Returns `None` for anything that is not one of our announcements.
pub fn decode_announcement(datagram: &[u8]) -> Option<Announcement> {
    if datagram.len() < DISCOVERY_MAGIC.len() + 2 {
        return None;
    }
    if &datagram[..DISCOVERY_MAGIC.len()] != DISCOVERY_MAGIC {
        return None;
    }
    let mut buf = Bytes::copy_from_slice(&datagram[DISCOVERY_MAGIC.len()..]);
    let server_port = buf.get_u16();
    let client_name = take_string(&mut buf, "client name").ok()?;
    Some(Announcement {
        server_port,
        client_name,
    })
}

/// Codec framing [`Message`] values for `FramedRead`/`FramedWrite`.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = SyncError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> SyncResult<()> {
        let mut body = BytesMut::with_capacity(64);
        encode_body(&msg, &mut body);
        if body.len() > MAX_FRAME_SIZE {
            return Err(SyncError::FrameTooLarge {
                got: body.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        dst.reserve(FRAME_HEADER_SIZE + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> SyncResult<Option<Message>> {
        loop {
            if src.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }
            let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if len > MAX_FRAME_SIZE {
                return Err(SyncError::FrameTooLarge {
                    got: len,
                    limit: MAX_FRAME_SIZE,
                });
            }
            if len == 0 {
                return Err(SyncError::MalformedFrame("empty frame".to_string()));
            }
            if src.len() < FRAME_HEADER_SIZE + len {
                src.reserve(FRAME_HEADER_SIZE + len - src.len());
                return Ok(None);
            }
            src.advance(FRAME_HEADER_SIZE);
            let mut body = src.split_to(len).freeze();
            let kind_code = body.get_u8();
            match decode_body(kind_code, body)? {
                Some(msg) => return Ok(Some(msg)),
                None => {
                    warn!(kind = kind_code, len, "Skipping frame with unknown kind");
                    continue;
                }
            }
        }
    }
}

fn encode_body(msg: &Message, buf: &mut BytesMut) {
    buf.put_u8(msg.kind());
    match msg {
        Message::Greeting { title, server_port } => {
            put_string(buf, title);
            buf.put_u16(*server_port);
        }
        Message::Synchronize => {}
        Message::SynchronizeList { ports } => {
            buf.put_u16(ports.len() as u16);
            for port in ports {
                buf.put_u16(*port);
            }
        }
        Message::StopSynchronize => {}
        Message::Title { title } => {
            put_string(buf, title);
        }
        Message::Transform {
            view,
            image,
            canvas,
        } => {
            put_transform(buf, view);
            put_transform(buf, image);
            buf.put_f64(canvas.x);
            buf.put_f64(canvas.y);
        }
        Message::Position {
            rect,
            opacity,
            overlaid,
        } => {
            buf.put_i32(rect.x);
            buf.put_i32(rect.y);
            buf.put_i32(rect.width);
            buf.put_i32(rect.height);
            put_bool(buf, *opacity);
            put_bool(buf, *overlaid);
        }
        Message::NewFile { op, filename } => {
            buf.put_i16(*op);
            put_string(buf, filename);
        }
        Message::NewImage { title, data } => {
            put_string(buf, title);
            buf.put_u32(data.len() as u32);
            buf.put_slice(data);
        }
        Message::UpcomingImage { title } => {
            put_string(buf, title);
        }
        Message::SwitchServer { addr, port } => {
            put_string(buf, &addr.to_string());
            buf.put_u16(*port);
        }
        Message::PermissionRequest => {}
        Message::Permission { allowed } => {
            put_bool(buf, *allowed);
        }
        Message::ModeChange { mode } => {
            buf.put_i32(*mode);
        }
        Message::GoodBye => {}
        Message::Quit => {}
    }
}

/// Decode a frame body. `None` means the kind is unknown and the frame
/// should be skipped.
fn decode_body(kind_code: u8, mut buf: Bytes) -> SyncResult<Option<Message>> {
    let msg = match kind_code {
        kind::GREETING => {
            let title = take_string(&mut buf, "greeting title")?;
            let server_port = take_u16(&mut buf, "greeting server port")?;
            Message::Greeting { title, server_port }
        }
        kind::SYNCHRONIZE => Message::Synchronize,
        kind::SYNCHRONIZE_LIST => {
            let count = take_u16(&mut buf, "port count")? as usize;
            let mut ports = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                ports.push(take_u16(&mut buf, "port entry")?);
            }
            Message::SynchronizeList { ports }
        }
        kind::STOP_SYNCHRONIZE => Message::StopSynchronize,
        kind::TITLE => {
            let title = take_string(&mut buf, "title")?;
            Message::Title { title }
        }
        kind::TRANSFORM => {
            let view = take_transform(&mut buf, "view transform")?;
            let image = take_transform(&mut buf, "image transform")?;
            let x = take_f64(&mut buf, "canvas width")?;
            let y = take_f64(&mut buf, "canvas height")?;
            Message::Transform {
                view,
                image,
                canvas: PointF::new(x, y),
            }
        }
        kind::POSITION => {
            let x = take_i32(&mut buf, "rect x")?;
            let y = take_i32(&mut buf, "rect y")?;
            let width = take_i32(&mut buf, "rect width")?;
            let height = take_i32(&mut buf, "rect height")?;
            let opacity = take_bool(&mut buf, "opacity flag")?;
            let overlaid = take_bool(&mut buf, "overlaid flag")?;
            Message::Position {
                rect: WindowRect::new(x, y, width, height),
                opacity,
                overlaid,
            }
        }
        kind::NEW_FILE => {
            let op = take_i16(&mut buf, "file op")?;
            let filename = take_string(&mut buf, "filename")?;
            Message::NewFile { op, filename }
        }
        kind::NEW_IMAGE => {
            let title = take_string(&mut buf, "image title")?;
            let data = take_blob(&mut buf, "image data")?;
            Message::NewImage { title, data }
        }
        kind::UPCOMING_IMAGE => {
            let title = take_string(&mut buf, "upcoming title")?;
            Message::UpcomingImage { title }
        }
        kind::SWITCH_SERVER => {
            let raw = take_string(&mut buf, "server address")?;
            let addr: IpAddr = raw.parse().map_err(|_| {
                SyncError::MalformedFrame(format!("bad server address: {}", raw))
            })?;
            let port = take_u16(&mut buf, "server port")?;
            Message::SwitchServer { addr, port }
        }
        kind::PERMISSION_REQUEST => Message::PermissionRequest,
        kind::PERMISSION => {
            let allowed = take_bool(&mut buf, "permission flag")?;
            Message::Permission { allowed }
        }
        kind::MODE_CHANGE => {
            let mode = take_i32(&mut buf, "mode code")?;
            Message::ModeChange { mode }
        }
        kind::GOODBYE => Message::GoodBye,
        kind::QUIT => Message::Quit,
        _ => return Ok(None),
    };
    if buf.has_remaining() {
        return Err(SyncError::MalformedFrame(format!(
            "{} trailing bytes after {}",
            buf.remaining(),
            msg.kind_name()
        )));
    }
    Ok(Some(msg))
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(v as u8);
}

fn put_transform(buf: &mut BytesMut, t: &Transform) {
    for coefficient in t.coefficients() {
        buf.put_f64(coefficient);
    }
}

fn need(buf: &Bytes, n: usize, what: &str) -> SyncResult<()> {
    if buf.remaining() < n {
        return Err(SyncError::MalformedFrame(format!("truncated {}", what)));
    }
    Ok(())
}

fn take_string(buf: &mut Bytes, what: &str) -> SyncResult<String> {
    need(buf, 4, what)?;
    let len = buf.get_u32() as usize;
    need(buf, len, what)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| SyncError::MalformedFrame(format!("{} is not valid UTF-8", what)))
}

fn take_blob(buf: &mut Bytes, what: &str) -> SyncResult<Bytes> {
    need(buf, 4, what)?;
    let len = buf.get_u32() as usize;
    need(buf, len, what)?;
    Ok(buf.split_to(len))
}

fn take_u16(buf: &mut Bytes, what: &str) -> SyncResult<u16> {
    need(buf, 2, what)?;
    Ok(buf.get_u16())
}

fn take_i16(buf: &mut Bytes, what: &str) -> SyncResult<i16> {
    need(buf, 2, what)?;
    Ok(buf.get_i16())
}

fn take_i32(buf: &mut Bytes, what: &str) -> SyncResult<i32> {
    need(buf, 4, what)?;
    Ok(buf.get_i32())
}

fn take_f64(buf: &mut Bytes, what: &str) -> SyncResult<f64> {
    need(buf, 8, what)?;
    Ok(buf.get_f64())
}

fn take_bool(buf: &mut Bytes, what: &str) -> SyncResult<bool> {
    need(buf, 1, what)?;
    Ok(buf.get_u8() != 0)
}

fn take_transform(buf: &mut Bytes, what: &str) -> SyncResult<Transform> {
    let mut m = [0.0f64; 9];
    for slot in &mut m {
        *slot = take_f64(buf, what)?;
    }
    Ok(Transform::from_coefficients(m))
}
