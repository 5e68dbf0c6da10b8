//! Minimal M3U8 playlist parser, covering the subset of tags needed to
//! reconstruct a fragmented audio stream: version, target duration, media
//! sequence, byte ranges, init segments (EXT-X-MAP), encryption keys,
//! variant references (EXT-X-STREAM-INF) and the end marker. Unknown tags
//! are ignored, not fatal.

use url::Url;

use crate::error::DownloadError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub length: u64,
    /// When absent the sub-range starts where the previous segment's ended.
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRef {
    pub uri: String,
    pub duration: Option<f64>,
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    pub method: String,
    pub uri: Option<String>,
}

#[derive(Debug, Default)]
pub struct MediaManifest {
    pub version: Option<u32>,
    pub target_duration: Option<f64>,
    pub media_sequence: u64,
    pub init_segment: Option<SegmentRef>,
    pub key: Option<EncryptionKey>,
    pub segments: Vec<SegmentRef>,
    /// Variant playlist URIs; non-empty means this was a master playlist.
    pub variants: Vec<String>,
    pub ended: bool,
}

impl MediaManifest {
    pub fn is_master(&self) -> bool {
        !self.variants.is_empty()
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(&self.key, Some(k) if !k.method.eq_ignore_ascii_case("NONE"))
    }
}

pub fn parse(text: &str, base_url: &str) -> Result<MediaManifest, DownloadError> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        Some("#EXTM3U") => {}
        _ => return Err(DownloadError::Manifest("missing #EXTM3U header".into())),
    }

    let base = Url::parse(base_url).ok();
    let mut manifest = MediaManifest::default();
    let mut pending_duration: Option<f64> = None;
    let mut pending_range: Option<ByteRange> = None;
    let mut expecting_variant = false;

    for line in lines {
        if let Some(rest) = line.strip_prefix("#EXT-X-VERSION:") {
            manifest.version = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            manifest.target_duration = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            manifest.media_sequence = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("#EXT-X-BYTERANGE:") {
            pending_range = parse_byte_range(rest);
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MAP:") {
            let attrs = parse_attributes(rest);
            if let Some(uri) = attr(&attrs, "URI") {
                manifest.init_segment = Some(SegmentRef {
                    uri: resolve(&base, uri),
                    duration: None,
                    byte_range: attr(&attrs, "BYTERANGE").and_then(|r| parse_byte_range(r)),
                });
            }
        } else if let Some(rest) = line.strip_prefix("#EXT-X-KEY:") {
            let attrs = parse_attributes(rest);
            manifest.key = Some(EncryptionKey {
                method: attr(&attrs, "METHOD").unwrap_or("NONE").to_string(),
                uri: attr(&attrs, "URI").map(|u| resolve(&base, u)),
            });
        } else if line.starts_with("#EXT-X-STREAM-INF:") {
            expecting_variant = true;
        } else if line == "#EXT-X-ENDLIST" {
            manifest.ended = true;
        } else if let Some(rest) = line.strip_prefix("#EXTINF:") {
            pending_duration = rest.split(',').next().and_then(|d| d.trim().parse().ok());
        } else if line.starts_with('#') {
            // Unsupported tag or comment; skipped.
        } else if expecting_variant {
            manifest.variants.push(resolve(&base, line));
            expecting_variant = false;
        } else {
            manifest.segments.push(SegmentRef {
                uri: resolve(&base, line),
                duration: pending_duration.take(),
                byte_range: pending_range.take(),
            });
        }
    }

    Ok(manifest)
}

/// "<length>[@<offset>]"
fn parse_byte_range(value: &str) -> Option<ByteRange> {
    let mut parts = value.trim().splitn(2, '@');
    let length = parts.next()?.parse().ok()?;
    let offset = match parts.next() {
        Some(o) => Some(o.parse().ok()?),
        None => None,
    };
    Some(ByteRange { length, offset })
}

/// Parse the `KEY=VALUE,KEY="VALUE"` attribute list syntax.
fn parse_attributes(value: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut rest = value.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];

        let val;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(close) = stripped.find('"') else { break };
            val = stripped[..close].to_string();
            rest = stripped[close + 1..].trim_start_matches(',').trim_start();
        } else {
            match rest.find(',') {
                Some(comma) => {
                    val = rest[..comma].trim().to_string();
                    rest = rest[comma + 1..].trim_start();
                }
                None => {
                    val = rest.trim().to_string();
                    rest = "";
                }
            }
        }
        attrs.push((key, val));
    }
    attrs
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn resolve(base: &Option<Url>, uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return uri.to_string();
    }
    match base {
        Some(base) => base
            .join(uri)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| uri.to_string()),
        None => uri.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://cdn.example.com/streams/track/playlist.m3u8";

    #[test]
    fn parses_media_playlist_with_init_segment() {
        let text = r#"#EXTM3U
#EXT-X-VERSION:6
#EXT-X-TARGETDURATION:10
#EXT-X-MEDIA-SEQUENCE:3
#EXT-X-MAP:URI="init.mp4"
#EXTINF:9.98,
seg0.m4s
#EXTINF:10.0,
seg1.m4s
#EXTINF:4.2,
https://other.example.com/seg2.m4s
#EXT-X-ENDLIST
"#;
        let m = parse(text, BASE).unwrap();
        assert_eq!(m.version, Some(6));
        assert_eq!(m.target_duration, Some(10.0));
        assert_eq!(m.media_sequence, 3);
        assert!(m.ended);
        assert!(!m.is_master());
        assert!(!m.is_encrypted());

        let init = m.init_segment.unwrap();
        assert_eq!(init.uri, "https://cdn.example.com/streams/track/init.mp4");

        assert_eq!(m.segments.len(), 3);
        assert_eq!(m.segments[0].uri, "https://cdn.example.com/streams/track/seg0.m4s");
        assert_eq!(m.segments[0].duration, Some(9.98));
        assert_eq!(m.segments[2].uri, "https://other.example.com/seg2.m4s");
    }

    #[test]
    fn parses_byte_ranges_with_and_without_offset() {
        let text = "#EXTM3U\n#EXT-X-BYTERANGE:1000@0\nall.aac\n#EXT-X-BYTERANGE:500\nall.aac\n";
        let m = parse(text, BASE).unwrap();
        assert_eq!(
            m.segments[0].byte_range,
            Some(ByteRange { length: 1000, offset: Some(0) })
        );
        assert_eq!(
            m.segments[1].byte_range,
            Some(ByteRange { length: 500, offset: None })
        );
    }

    #[test]
    fn detects_encryption() {
        let text = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n#EXTINF:4,\ns.ts\n";
        let m = parse(text, BASE).unwrap();
        assert!(m.is_encrypted());
        assert_eq!(
            m.key.unwrap().uri.unwrap(),
            "https://cdn.example.com/streams/track/key.bin"
        );

        let text = "#EXTM3U\n#EXT-X-KEY:METHOD=NONE\n#EXTINF:4,\ns.ts\n";
        assert!(!parse(text, BASE).unwrap().is_encrypted());
    }

    #[test]
    fn master_playlist_collects_variants() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=128000,CODECS=\"mp4a.40.2\"\nhq/playlist.m3u8\n";
        let m = parse(text, BASE).unwrap();
        assert!(m.is_master());
        assert_eq!(
            m.variants,
            vec!["https://cdn.example.com/streams/track/hq/playlist.m3u8"]
        );
        assert!(m.segments.is_empty());
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let text = "#EXTM3U\n#EXT-X-SOMETHING-NEW:42\n#EXTINF:4,\ns.ts\n";
        let m = parse(text, BASE).unwrap();
        assert_eq!(m.segments.len(), 1);
    }

    #[test]
    fn missing_header_is_an_error() {
        assert!(parse("#EXT-X-VERSION:3\n", BASE).is_err());
        assert!(parse("", BASE).is_err());
    }
}
