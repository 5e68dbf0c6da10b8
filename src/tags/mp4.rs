//! MP4/M4A metadata atom writer.
//!
//! Parses the container's atom boundaries into an arena-indexed tree (atoms
//! the writer never touches stay as opaque byte ranges over the source
//! buffer), lazily materializes the `moov > udta > meta > ilst` path, and on
//! serialization recomputes every ancestor length bottom-up in one pass
//! before writing headers and bodies out in order.
//!
//! A buffer without a top-level `moov` atom is not taggable: every setter
//! becomes a no-op and the original bytes flow through unchanged.

use super::{
    require_non_empty, require_track_number, require_year, sniff_artwork_mime, TagError,
    TaggedBuffer, TagWriter,
};

const HEADER_LEN: usize = 8;

/// Type flag carried in a `data` sub-atom, chosen by the item atom's name.
fn data_flag_for(name: &[u8; 4]) -> u32 {
    match name {
        b"covr" => 13,
        b"trkn" | b"disk" => 0,
        b"tmpo" | b"cpil" | b"rtng" => 21,
        _ => 1,
    }
}

/// Atoms the parser descends into. Anything else stays an opaque leaf.
fn is_container(name: &[u8; 4]) -> bool {
    matches!(
        name,
        b"moov" | b"udta" | b"trak" | b"mdia" | b"minf" | b"stbl" | b"meta" | b"ilst"
    )
}

/// Version/flags bytes sitting between a container's header and its children.
fn container_extra(name: &[u8; 4]) -> usize {
    match name {
        b"meta" => 4,
        b"stsd" => 8,
        _ => 0,
    }
}

#[derive(Debug)]
enum Payload {
    /// Byte range into the original buffer (leaf we never modified).
    Slice { start: usize, len: usize },
    /// Bytes created or replaced by the writer.
    Owned(Vec<u8>),
    /// Content is the concatenation of the children.
    Container,
}

#[derive(Debug)]
struct AtomNode {
    name: [u8; 4],
    payload: Payload,
    children: Vec<usize>,
    extra: Vec<u8>,
    size: u64,
}

pub struct Mp4Writer {
    source: Vec<u8>,
    arena: Vec<AtomNode>,
    roots: Vec<usize>,
    valid: bool,
    edited: bool,
}

fn read_header(buf: &[u8], offset: usize) -> Option<([u8; 4], usize)> {
    if offset + HEADER_LEN > buf.len() {
        return None;
    }
    let size = u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
        as usize;
    let name = [buf[offset + 4], buf[offset + 5], buf[offset + 6], buf[offset + 7]];
    Some((name, size))
}

impl Mp4Writer {
    pub fn new(source: Vec<u8>) -> Self {
        let mut writer = Self {
            source,
            arena: Vec::new(),
            roots: Vec::new(),
            valid: false,
            edited: false,
        };
        writer.parse_top_level();
        writer
    }

    /// Walk the top-level atoms. A size smaller than a header would stop the
    /// offset from advancing; that, a truncated atom, or a missing `moov`
    /// leaves the writer in passthrough mode.
    fn parse_top_level(&mut self) {
        let end = self.source.len();
        let mut roots = Vec::new();
        let mut offset = 0usize;
        let mut saw_moov = false;

        while offset < end {
            let Some((name, size)) = read_header(&self.source, offset) else {
                return;
            };
            if size < HEADER_LEN || offset + size > end {
                return;
            }
            if name == *b"moov" {
                saw_moov = true;
            }
            let idx = self.parse_atom(name, offset, size);
            roots.push(idx);
            offset += size;
        }

        if saw_moov {
            self.roots = roots;
            self.valid = true;
        }
    }

    fn parse_atom(&mut self, name: [u8; 4], offset: usize, size: usize) -> usize {
        let body_start = offset + HEADER_LEN;
        let body_len = size - HEADER_LEN;

        if is_container(&name) {
            let extra_len = container_extra(&name);
            if body_len >= extra_len {
                if let Some(children) =
                    self.parse_children(body_start + extra_len, body_len - extra_len)
                {
                    let extra = self.source[body_start..body_start + extra_len].to_vec();
                    let idx = self.arena.len();
                    self.arena.push(AtomNode {
                        name,
                        payload: Payload::Container,
                        children,
                        extra,
                        size: 0,
                    });
                    return idx;
                }
            }
        }

        let idx = self.arena.len();
        self.arena.push(AtomNode {
            name,
            payload: Payload::Slice {
                start: body_start,
                len: body_len,
            },
            children: Vec::new(),
            extra: Vec::new(),
            size: 0,
        });
        idx
    }

    /// Parse a container's children; `None` (and an untouched arena) when the
    /// body is not a clean sequence of atoms, so the caller keeps the
    /// container as an opaque leaf.
    fn parse_children(&mut self, start: usize, len: usize) -> Option<Vec<usize>> {
        let snapshot = self.arena.len();
        let mut children = Vec::new();
        let end = start + len;
        let mut offset = start;

        while offset < end {
            let Some((name, size)) = read_header(&self.source, offset) else {
                self.arena.truncate(snapshot);
                return None;
            };
            if size < HEADER_LEN || offset + size > end {
                self.arena.truncate(snapshot);
                return None;
            }
            let idx = self.parse_atom(name, offset, size);
            children.push(idx);
            offset += size;
        }
        Some(children)
    }

    fn find_child(&self, parent: usize, name: [u8; 4]) -> Option<usize> {
        self.arena[parent]
            .children
            .iter()
            .copied()
            .find(|&c| self.arena[c].name == name)
    }

    fn ensure_container(&mut self, parent: usize, name: [u8; 4]) -> Result<usize, TagError> {
        if !matches!(self.arena[parent].payload, Payload::Container) {
            return Err(TagError::InvalidValue {
                field: "metadata",
                reason: "existing container atom could not be parsed".into(),
            });
        }
        if let Some(idx) = self.find_child(parent, name) {
            return match self.arena[idx].payload {
                Payload::Container => Ok(idx),
                _ => Err(TagError::InvalidValue {
                    field: "metadata",
                    reason: "existing metadata atom could not be parsed".into(),
                }),
            };
        }
        let idx = self.arena.len();
        self.arena.push(AtomNode {
            name,
            payload: Payload::Container,
            children: Vec::new(),
            extra: vec![0u8; container_extra(&name)],
            size: 0,
        });
        self.arena[parent].children.push(idx);
        Ok(idx)
    }

    /// Insert or replace an `ilst` item atom wrapping one `data` sub-atom.
    fn set_ilst_value(&mut self, name: [u8; 4], payload: Vec<u8>) -> Result<(), TagError> {
        if !self.valid {
            return Ok(());
        }
        let Some(moov) = self
            .roots
            .iter()
            .copied()
            .find(|&r| self.arena[r].name == *b"moov")
        else {
            return Ok(());
        };

        let udta = self.ensure_container(moov, *b"udta")?;
        let meta = self.ensure_container(udta, *b"meta")?;
        let ilst = self.ensure_container(meta, *b"ilst")?;

        let mut item = Vec::with_capacity(12 + payload.len());
        item.extend_from_slice(&((12 + payload.len()) as u32).to_be_bytes());
        item.extend_from_slice(b"data");
        item.extend_from_slice(&data_flag_for(&name).to_be_bytes());
        item.extend_from_slice(&payload);

        match self.find_child(ilst, name) {
            Some(existing) => {
                self.arena[existing].payload = Payload::Owned(item);
                self.arena[existing].children.clear();
            }
            None => {
                let idx = self.arena.len();
                self.arena.push(AtomNode {
                    name,
                    payload: Payload::Owned(item),
                    children: Vec::new(),
                    extra: Vec::new(),
                    size: 0,
                });
                self.arena[ilst].children.push(idx);
            }
        }
        self.edited = true;
        Ok(())
    }

    fn set_text(&mut self, name: [u8; 4], text: &str) -> Result<(), TagError> {
        self.set_ilst_value(name, text.as_bytes().to_vec())
    }

    /// Single bottom-up pass assigning every node its serialized length.
    fn compute_size(&mut self, idx: usize) -> u64 {
        let base = (HEADER_LEN + self.arena[idx].extra.len()) as u64;
        let size = if matches!(self.arena[idx].payload, Payload::Container) {
            let children = self.arena[idx].children.clone();
            let mut total = base;
            for child in children {
                total += self.compute_size(child);
            }
            total
        } else {
            let body = match &self.arena[idx].payload {
                Payload::Slice { len, .. } => *len as u64,
                Payload::Owned(bytes) => bytes.len() as u64,
                Payload::Container => 0,
            };
            base + body
        };
        self.arena[idx].size = size;
        size
    }

    fn write_atom(&self, idx: usize, out: &mut Vec<u8>) {
        let node = &self.arena[idx];
        out.extend_from_slice(&(node.size as u32).to_be_bytes());
        out.extend_from_slice(&node.name);
        out.extend_from_slice(&node.extra);
        match &node.payload {
            Payload::Slice { start, len } => out.extend_from_slice(&self.source[*start..*start + *len]),
            Payload::Owned(bytes) => out.extend_from_slice(bytes),
            Payload::Container => {
                for &child in &node.children {
                    self.write_atom(child, out);
                }
            }
        }
    }
}

impl TagWriter for Mp4Writer {
    fn set_title(&mut self, title: &str) -> Result<(), TagError> {
        require_non_empty("title", title)?;
        self.set_text(*b"\xA9nam", title)
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
        self.set_text(*b"\xA9ART", &artists.join("/"))
    }

    fn set_album(&mut self, album: &str) -> Result<(), TagError> {
        require_non_empty("album", album)?;
        self.set_text(*b"\xA9alb", album)
    }

    fn set_comment(&mut self, comment: &str) -> Result<(), TagError> {
        require_non_empty("comment", comment)?;
        self.set_text(*b"\xA9cmt", comment)
    }

    fn set_track_number(&mut self, number: u16, total: Option<u16>) -> Result<(), TagError> {
        require_track_number(number)?;
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(&number.to_be_bytes());
        payload.extend_from_slice(&total.unwrap_or(0).to_be_bytes());
        payload.extend_from_slice(&[0, 0]);
        self.set_ilst_value(*b"trkn", payload)
    }

    fn set_year(&mut self, year: i32) -> Result<(), TagError> {
        require_year(year)?;
        self.set_text(*b"\xA9day", &year.to_string())
    }

    fn set_grouping(&mut self, grouping: &str) -> Result<(), TagError> {
        require_non_empty("grouping", grouping)?;
        self.set_text(*b"\xA9grp", grouping)
    }

    fn set_artwork(&mut self, image: &[u8]) -> Result<(), TagError> {
        sniff_artwork_mime(image).ok_or(TagError::UnknownArtworkFormat)?;
        self.set_ilst_value(*b"covr", image.to_vec())
    }

    fn set_external_track_id(&mut self, id: &str) -> Result<(), TagError> {
        require_non_empty("external track id", id)?;
        self.set_text(*b"xid ", id)
    }

    fn into_buffer(self: Box<Self>) -> TaggedBuffer {
        if !self.valid {
            return TaggedBuffer {
                bytes: self.source,
                tags_applied: false,
                message: Some("no top-level moov atom; metadata skipped".into()),
            };
        }
        if !self.edited {
            return TaggedBuffer {
                bytes: self.source,
                tags_applied: false,
                message: Some("no tag fields were set".into()),
            };
        }

        let mut this = *self;
        let roots = this.roots.clone();
        let mut total = 0u64;
        for &root in &roots {
            total += this.compute_size(root);
        }

        let mut bytes = Vec::with_capacity(total as usize);
        for &root in &roots {
            this.write_atom(root, &mut bytes);
        }
        TaggedBuffer {
            bytes,
            tags_applied: true,
            message: None,
        }
    }
}
