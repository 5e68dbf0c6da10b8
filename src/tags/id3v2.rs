//! ID3v2.3 tag writer for MP3 buffers.
//!
//! Serializes a complete tag in front of the original audio bytes: 10-byte
//! header ("ID3", version 3, flags 0, synchsafe 28-bit size), one 10-byte
//! header + body per frame (synchsafe frame size, two zero flag bytes), a
//! fixed padding region, then the untouched audio. Frame bodies come from a
//! declarative value table; adding a frame kind is a data addition, not new
//! control flow.

use super::{
    require_non_empty, require_track_number, require_year, sniff_artwork_mime, TagError,
    TaggedBuffer, TagWriter,
};

const PADDING_SIZE: usize = 512;

/// TXXX description under which the external track id is stored.
pub const EXTERNAL_ID_DESCRIPTION: &str = "TRACK_ID";

/// How a frame body is encoded. Text uses UTF-16LE with a BOM and encoding
/// indicator 1; numeric strings use ISO-8859-1 digits with indicator 0.
#[derive(Debug, Clone, PartialEq)]
enum FrameValue {
    Text(String),
    Numeric(String),
    Comment(String),
    UserText { description: String, value: String },
    Picture { mime: &'static str, data: Vec<u8> },
}

#[derive(Debug, Clone)]
struct Frame {
    id: [u8; 4],
    value: FrameValue,
}

pub struct Id3v2Writer {
    frames: Vec<Frame>,
    audio: Vec<u8>,
}

impl Id3v2Writer {
    pub fn new(audio: Vec<u8>) -> Self {
        Self {
            frames: Vec::new(),
            audio,
        }
    }

    /// Insert or replace the frame with the given id.
    fn upsert(&mut self, id: [u8; 4], value: FrameValue) {
        match self.frames.iter_mut().find(|f| f.id == id) {
            Some(frame) => frame.value = value,
            None => self.frames.push(Frame { id, value }),
        }
    }
}

impl TagWriter for Id3v2Writer {
    fn set_title(&mut self, title: &str) -> Result<(), TagError> {
        require_non_empty("title", title)?;
        self.upsert(*b"TIT2", FrameValue::Text(title.to_string()));
        Ok(())
    }

    fn set_artists(&mut self, artists: &[String]) -> Result<(), TagError> {
        if artists.is_empty() {
            return Err(TagError::InvalidValue {
                field: "artists",
                reason: "must contain at least one artist".into(),
            });
        }
        for artist in artists {
            require_non_empty("artists", artist)?;
        }
        self.upsert(*b"TPE1", FrameValue::Text(artists.join("/")));
        Ok(())
    }

    fn set_album(&mut self, album: &str) -> Result<(), TagError> {
        require_non_empty("album", album)?;
        self.upsert(*b"TALB", FrameValue::Text(album.to_string()));
        Ok(())
    }

    fn set_comment(&mut self, comment: &str) -> Result<(), TagError> {
        require_non_empty("comment", comment)?;
        self.upsert(*b"COMM", FrameValue::Comment(comment.to_string()));
        Ok(())
    }

    fn set_track_number(&mut self, number: u16, total: Option<u16>) -> Result<(), TagError> {
        require_track_number(number)?;
        let text = match total {
            Some(total) if total > 0 => format!("{}/{}", number, total),
            _ => number.to_string(),
        };
        self.upsert(*b"TRCK", FrameValue::Numeric(text));
        Ok(())
    }

    fn set_year(&mut self, year: i32) -> Result<(), TagError> {
        require_year(year)?;
        self.upsert(*b"TYER", FrameValue::Numeric(year.to_string()));
        Ok(())
    }

    fn set_grouping(&mut self, grouping: &str) -> Result<(), TagError> {
        require_non_empty("grouping", grouping)?;
        self.upsert(*b"TIT1", FrameValue::Text(grouping.to_string()));
        Ok(())
    }

    fn set_artwork(&mut self, image: &[u8]) -> Result<(), TagError> {
        let mime = sniff_artwork_mime(image).ok_or(TagError::UnknownArtworkFormat)?;
        self.upsert(
            *b"APIC",
            FrameValue::Picture {
                mime,
                data: image.to_vec(),
            },
        );
        Ok(())
    }

    fn set_external_track_id(&mut self, id: &str) -> Result<(), TagError> {
        require_non_empty("external track id", id)?;
        self.upsert(
            *b"TXXX",
            FrameValue::UserText {
                description: EXTERNAL_ID_DESCRIPTION.to_string(),
                value: id.to_string(),
            },
        );
        Ok(())
    }

    fn into_buffer(self: Box<Self>) -> TaggedBuffer {
        if self.frames.is_empty() {
            return TaggedBuffer {
                bytes: self.audio,
                tags_applied: false,
                message: Some("no tag fields were set".into()),
            };
        }

        let mut frames_blob = Vec::new();
        for frame in &self.frames {
            let body = encode_body(&frame.value);
            frames_blob.extend_from_slice(&frame.id);
            frames_blob.extend_from_slice(&synchsafe(body.len() as u32));
            frames_blob.extend_from_slice(&[0, 0]);
            frames_blob.extend_from_slice(&body);
        }

        let tag_size = frames_blob.len() + PADDING_SIZE;
        let mut bytes = Vec::with_capacity(10 + tag_size + self.audio.len());
        bytes.extend_from_slice(b"ID3");
        bytes.extend_from_slice(&[0x03, 0x00, 0x00]);
        bytes.extend_from_slice(&synchsafe(tag_size as u32));
        bytes.extend_from_slice(&frames_blob);
        bytes.resize(bytes.len() + PADDING_SIZE, 0);
        bytes.extend_from_slice(&self.audio);

        TaggedBuffer {
            bytes,
            tags_applied: true,
            message: None,
        }
    }
}

/// 28-bit synchsafe integer: 7 payload bits per byte, high bit always clear.
fn synchsafe(value: u32) -> [u8; 4] {
    [
        ((value >> 21) & 0x7F) as u8,
        ((value >> 14) & 0x7F) as u8,
        ((value >> 7) & 0x7F) as u8,
        (value & 0x7F) as u8,
    ]
}

fn utf16le_with_bom(text: &str) -> Vec<u8> {
    let mut out = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

fn encode_body(value: &FrameValue) -> Vec<u8> {
    match value {
        FrameValue::Text(text) => {
            let mut body = vec![0x01];
            body.extend_from_slice(&utf16le_with_bom(text));
            body
        }
        FrameValue::Numeric(digits) => {
            let mut body = vec![0x00];
            body.extend_from_slice(digits.as_bytes());
            body
        }
        FrameValue::Comment(text) => {
            // encoding, 3-byte language, empty described part, text
            let mut body = vec![0x01];
            body.extend_from_slice(b"eng");
            body.extend_from_slice(&utf16le_with_bom(""));
            body.extend_from_slice(&[0x00, 0x00]);
            body.extend_from_slice(&utf16le_with_bom(text));
            body
        }
        FrameValue::UserText { description, value } => {
            let mut body = vec![0x01];
            body.extend_from_slice(&utf16le_with_bom(description));
            body.extend_from_slice(&[0x00, 0x00]);
            body.extend_from_slice(&utf16le_with_bom(value));
            body
        }
        FrameValue::Picture { mime, data } => {
            // ISO-8859-1 encoding so the empty description terminates with
            // a single byte; picture type 3 = front cover.
            let mut body = vec![0x00];
            body.extend_from_slice(mime.as_bytes());
            body.push(0x00);
            body.push(0x03);
            body.push(0x00);
            body.extend_from_slice(data);
            body
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    fn writer_with_audio() -> Box<Id3v2Writer> {
        Box::new(Id3v2Writer::new(vec![0xAA; 64]))
    }

    fn unsynchsafe(bytes: &[u8]) -> u32 {
        ((bytes[0] as u32) << 21)
            | ((bytes[1] as u32) << 14)
            | ((bytes[2] as u32) << 7)
            | (bytes[3] as u32)
    }

    /// Minimal reader for the tags this writer produces.
    struct ParsedTag {
        frames: Vec<(String, Vec<u8>)>,
        declared_size: u32,
        audio_offset: usize,
    }

    fn parse_tag(bytes: &[u8]) -> ParsedTag {
        assert_eq!(&bytes[0..3], b"ID3");
        assert_eq!(bytes[3], 3);
        assert_eq!(bytes[4], 0);
        assert_eq!(bytes[5], 0);
        let declared_size = unsynchsafe(&bytes[6..10]);

        let mut frames = Vec::new();
        let mut offset = 10usize;
        let end = 10 + declared_size as usize;
        while offset + 10 <= end {
            if bytes[offset] == 0 {
                break; // padding
            }
            let id = String::from_utf8(bytes[offset..offset + 4].to_vec()).unwrap();
            let size = unsynchsafe(&bytes[offset + 4..offset + 8]) as usize;
            assert_eq!(&bytes[offset + 8..offset + 10], &[0, 0]);
            let body = bytes[offset + 10..offset + 10 + size].to_vec();
            frames.push((id, body));
            offset += 10 + size;
        }
        ParsedTag {
            frames,
            declared_size,
            audio_offset: end,
        }
    }

    fn decode_utf16(body: &[u8]) -> String {
        assert_eq!(body[0], 0x01, "expected UTF-16 encoding indicator");
        assert_eq!(&body[1..3], &[0xFF, 0xFE], "expected LE BOM");
        let units: Vec<u16> = body[3..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units).unwrap()
    }

    #[test]
    fn round_trips_text_and_numeric_frames() {
        let mut writer = writer_with_audio();
        writer.set_title("Nightfall – live").unwrap();
        writer.set_artists(&["First".to_string(), "Second".to_string()]).unwrap();
        writer.set_album("Sessions").unwrap();
        writer.set_track_number(9, Some(12)).unwrap();
        writer.set_year(2021).unwrap();
        writer.set_grouping("Ambient").unwrap();

        let out = writer.into_buffer();
        assert!(out.tags_applied);

        let tag = parse_tag(&out.bytes);
        let find = |id: &str| {
            tag.frames
                .iter()
                .find(|(fid, _)| fid == id)
                .map(|(_, body)| body.clone())
                .unwrap()
        };

        assert_eq!(decode_utf16(&find("TIT2")), "Nightfall – live");
        assert_eq!(decode_utf16(&find("TPE1")), "First/Second");
        assert_eq!(decode_utf16(&find("TALB")), "Sessions");
        assert_eq!(decode_utf16(&find("TIT1")), "Ambient");

        let trck = find("TRCK");
        assert_eq!(trck[0], 0x00);
        assert_eq!(&trck[1..], b"9/12");
        let tyer = find("TYER");
        assert_eq!(&tyer[1..], b"2021");

        // Original audio flows through unchanged after the tag.
        assert_eq!(&out.bytes[tag.audio_offset..], &[0xAA; 64]);
    }

    #[test]
    fn declared_size_is_frames_plus_padding() {
        let mut writer = writer_with_audio();
        writer.set_title("T").unwrap();
        writer.set_year(1999).unwrap();

        let out = writer.into_buffer();
        let tag = parse_tag(&out.bytes);
        let frame_bytes: usize = tag.frames.iter().map(|(_, b)| 10 + b.len()).sum();
        assert_eq!(tag.declared_size as usize, frame_bytes + 512);
        assert_eq!(out.bytes.len(), 10 + tag.declared_size as usize + 64);
    }

    #[test]
    fn picture_frame_carries_mime_and_payload() {
        let mut art = PNG_MAGIC.to_vec();
        art.extend_from_slice(&[1, 2, 3, 4]);

        let mut writer = writer_with_audio();
        writer.set_artwork(&art).unwrap();
        let out = writer.into_buffer();
        let tag = parse_tag(&out.bytes);
        let (_, body) = &tag.frames[0];

        assert_eq!(body[0], 0x00);
        let mime_end = 1 + body[1..].iter().position(|&b| b == 0).unwrap();
        assert_eq!(&body[1..mime_end], b"image/png");
        assert_eq!(body[mime_end + 1], 0x03);
        assert_eq!(&body[mime_end + 3..], &art[..]);
    }

    #[test]
    fn external_id_goes_into_a_user_text_frame() {
        let mut writer = writer_with_audio();
        writer.set_external_track_id("123456789").unwrap();
        let out = writer.into_buffer();
        let tag = parse_tag(&out.bytes);
        let (id, body) = &tag.frames[0];
        assert_eq!(id, "TXXX");
        assert_eq!(body[0], 0x01);
        // description, 2-byte terminator, value; both UTF-16LE with BOMs.
        // Scan on unit boundaries so a high byte of one unit next to a low
        // byte of the next cannot fake a terminator.
        let mut term = 3;
        while term + 1 < body.len() && (body[term] != 0 || body[term + 1] != 0) {
            term += 2;
        }
        let desc: Vec<u16> = body[3..term]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(String::from_utf16(&desc).unwrap(), EXTERNAL_ID_DESCRIPTION);
    }

    #[test]
    fn setters_reject_invalid_input() {
        let mut writer = writer_with_audio();
        assert!(writer.set_title("").is_err());
        assert!(writer.set_title("   ").is_err());
        assert!(writer.set_artists(&[]).is_err());
        assert!(writer.set_track_number(0, None).is_err());
        assert!(writer.set_year(0).is_err());
        assert!(writer.set_year(-4).is_err());
        assert!(writer.set_artwork(b"definitely not an image").is_err());
    }

    #[test]
    fn failed_setter_does_not_poison_the_buffer() {
        let mut writer = writer_with_audio();
        writer.set_title("Kept").unwrap();
        assert!(writer.set_year(0).is_err());
        writer.set_album("Also kept").unwrap();

        let out = writer.into_buffer();
        assert!(out.tags_applied);
        let tag = parse_tag(&out.bytes);
        let ids: Vec<&str> = tag.frames.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["TIT2", "TALB"]);
    }

    #[test]
    fn no_fields_set_returns_original_bytes() {
        let out = writer_with_audio().into_buffer();
        assert!(!out.tags_applied);
        assert_eq!(out.bytes, vec![0xAA; 64]);
        assert!(out.message.is_some());
    }

    #[test]
    fn setting_a_field_twice_replaces_the_frame() {
        let mut writer = writer_with_audio();
        writer.set_title("First").unwrap();
        writer.set_title("Second").unwrap();
        let out = writer.into_buffer();
        let tag = parse_tag(&out.bytes);
        assert_eq!(tag.frames.len(), 1);
        assert_eq!(decode_utf16(&tag.frames[0].1), "Second");
    }
}
