use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use super::buffer::{Reader, Writer};
use crate::error::{DecodeError, EncodeError, NameError};

const MAX_LABEL_LEN: usize = 63;
/// Encoded length limit, terminating root byte included.
const MAX_NAME_LEN: usize = 255;

/// A domain name as a sequence of raw labels.
///
/// Case is preserved for display; equality and hashing are ASCII
/// case-insensitive.
#[derive(Clone, Default)]
pub struct Name {
    labels: Vec<Vec<u8>>,
}

impl Name {
    /// The root name `.`.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse dotted text. A trailing dot is optional; `\.` and `\\` escape
    /// literal dots and backslashes inside a label.
    pub fn new(text: &str) -> Result<Self, NameError> {
        let mut labels = Vec::new();
        let mut current = Vec::new();
        let mut chars = text.chars();
        let mut pending = false;

        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    let escaped = chars
                        .next()
                        .ok_or_else(|| NameError::DanglingEscape(text.to_string()))?;
                    let mut utf8 = [0u8; 4];
                    current.extend_from_slice(escaped.encode_utf8(&mut utf8).as_bytes());
                    pending = true;
                }
                '.' => {
                    if current.is_empty() {
                        if labels.is_empty() && chars.as_str().is_empty() {
                            // "." alone is the root
                            break;
                        }
                        return Err(NameError::EmptyLabel(text.to_string()));
                    }
                    labels.push(std::mem::take(&mut current));
                    pending = false;
                }
                other => {
                    let mut utf8 = [0u8; 4];
                    current.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes());
                    pending = true;
                }
            }
        }
        if pending {
            labels.push(current);
        }

        Self::from_labels(labels)
    }

    /// Build from raw labels, validating lengths.
    pub fn from_labels(labels: Vec<Vec<u8>>) -> Result<Self, NameError> {
        for label in &labels {
            if label.is_empty() {
                return Err(NameError::EmptyLabel(String::new()));
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(NameError::LabelTooLong(label.len()));
            }
        }
        let name = Self { labels };
        let len = name.encoded_len();
        if len > MAX_NAME_LEN {
            return Err(NameError::NameTooLong(len));
        }
        Ok(name)
    }

    pub fn labels(&self) -> &[Vec<u8>] {
        &self.labels
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn first_label(&self) -> Option<&[u8]> {
        self.labels.first().map(Vec::as_slice)
    }

    /// The name with its first label removed.
    pub fn parent(&self) -> Name {
        Self {
            labels: self.labels.iter().skip(1).cloned().collect(),
        }
    }

    /// Prepend one raw label (dots inside `label` are kept literally).
    pub fn prepend(&self, label: &str) -> Result<Name, NameError> {
        let mut labels = Vec::with_capacity(self.labels.len() + 1);
        labels.push(label.as_bytes().to_vec());
        labels.extend(self.labels.iter().cloned());
        Self::from_labels(labels)
    }

    /// Whether `suffix` matches the trailing labels of this name.
    pub fn ends_with(&self, suffix: &Name) -> bool {
        if suffix.labels.len() > self.labels.len() {
            return false;
        }
        let skip = self.labels.len() - suffix.labels.len();
        self.labels[skip..]
            .iter()
            .zip(&suffix.labels)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// Uncompressed wire length.
    pub fn encoded_len(&self) -> usize {
        self.labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }

    fn lowercase_labels(&self, from: usize) -> Vec<Vec<u8>> {
        self.labels[from..]
            .iter()
            .map(|l| l.to_ascii_lowercase())
            .collect()
    }

    /// Decode a possibly compressed name starting at the reader's position.
    ///
    /// Every pointer must target an offset strictly before the start of the
    /// label run it interrupts, so run starts strictly decrease and decoding
    /// terminates.
    pub(crate) fn decode(reader: &mut Reader<'_>) -> Result<Name, DecodeError> {
        let buf = reader.buf();
        let mut pos = reader.pos();
        let mut run_start = pos;
        let mut end = None;
        let mut labels = Vec::new();
        let mut encoded_len = 1;

        loop {
            let len = *buf
                .get(pos)
                .ok_or(DecodeError::BufferTruncated { offset: pos })?;
            match len & 0xC0 {
                0x00 if len == 0 => {
                    if end.is_none() {
                        end = Some(pos + 1);
                    }
                    break;
                }
                0x00 => {
                    let start = pos + 1;
                    let label = buf
                        .get(start..start + len as usize)
                        .ok_or(DecodeError::BufferTruncated { offset: pos })?;
                    encoded_len += label.len() + 1;
                    if encoded_len > MAX_NAME_LEN {
                        return Err(DecodeError::NameTooLong);
                    }
                    labels.push(label.to_vec());
                    pos = start + label.len();
                }
                0xC0 => {
                    let low = *buf
                        .get(pos + 1)
                        .ok_or(DecodeError::BufferTruncated { offset: pos })?;
                    let target = (usize::from(len & 0x3F) << 8) | usize::from(low);
                    if target >= run_start {
                        return Err(DecodeError::PointerCycle { offset: pos });
                    }
                    if end.is_none() {
                        end = Some(pos + 2);
                    }
                    pos = target;
                    run_start = target;
                }
                _ => return Err(DecodeError::InvalidLabelType { offset: pos, byte: len }),
            }
        }

        if let Some(end) = end {
            reader.set_pos(end);
        }
        Ok(Name { labels })
    }

    /// Encode with greedy suffix compression against names already written
    /// in this message.
    pub(crate) fn encode(&self, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        for i in 0..self.labels.len() {
            let suffix = self.lowercase_labels(i);
            if let Some(offset) = writer.compression_target(&suffix) {
                return writer.u16(0xC000 | offset);
            }
            writer.remember_suffix(suffix, writer.pos());
            writer.u8(self.labels[i].len() as u8)?;
            writer.bytes(&self.labels[i])?;
        }
        writer.u8(0)
    }

    /// Encode without compression and without registering suffixes.
    pub(crate) fn encode_uncompressed(&self, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        for label in &self.labels {
            writer.u8(label.len() as u8)?;
            writer.bytes(label)?;
        }
        writer.u8(0)
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(&other.labels)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.labels.len());
        for label in &self.labels {
            state.write_usize(label.len());
            for b in label {
                state.write_u8(b.to_ascii_lowercase());
            }
        }
    }
}

impl FromStr for Name {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Name::new(s)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return f.write_str(".");
        }
        for label in &self.labels {
            for c in String::from_utf8_lossy(label).chars() {
                if c == '.' || c == '\\' {
                    f.write_str("\\")?;
                }
                write!(f, "{}", c)?;
            }
            f.write_str(".")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_at(buf: &[u8], pos: usize) -> Result<Name, DecodeError> {
        let mut reader = Reader::new(buf);
        reader.set_pos(pos);
        Name::decode(&mut reader)
    }

    #[test]
    fn test_parse_and_display() {
        let name = Name::new("printer._ipp._tcp.local").unwrap();
        assert_eq!(name.labels().len(), 4);
        assert_eq!(name.to_string(), "printer._ipp._tcp.local.");
        assert_eq!(Name::new("printer._ipp._tcp.local.").unwrap(), name);
    }

    #[test]
    fn test_root() {
        assert!(Name::new(".").unwrap().is_root());
        assert!(Name::new("").unwrap().is_root());
        assert_eq!(Name::root().to_string(), ".");
    }

    #[test]
    fn test_escaped_dot_stays_in_label() {
        let name = Name::new(r"Living Room\.2._ipp._tcp.local").unwrap();
        assert_eq!(name.first_label(), Some(&b"Living Room.2"[..]));
        assert_eq!(name.to_string(), r"Living Room\.2._ipp._tcp.local.");
    }

    #[test]
    fn test_comparison_is_case_insensitive() {
        let a = Name::new("Printer._IPP._tcp.LOCAL").unwrap();
        let b = Name::new("printer._ipp._tcp.local").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "Printer._IPP._tcp.LOCAL.");

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_rejects_bad_names() {
        assert_eq!(
            Name::new("a..b"),
            Err(NameError::EmptyLabel("a..b".to_string()))
        );
        assert_eq!(
            Name::new(&"x".repeat(64)),
            Err(NameError::LabelTooLong(64))
        );
        let long = vec!["a".repeat(63); 4].join(".");
        assert!(matches!(Name::new(&long), Err(NameError::NameTooLong(_))));
    }

    #[test]
    fn test_ends_with_and_parent() {
        let name = Name::new("printer._ipp._tcp.local").unwrap();
        let service = Name::new("_IPP._tcp.local").unwrap();
        assert!(name.ends_with(&service));
        assert!(!service.ends_with(&name));
        assert_eq!(name.parent(), service);
        assert_eq!(service.prepend("printer").unwrap(), name);
    }

    #[test]
    fn test_decode_follows_backward_pointer() {
        // "local" at 0, then "host" + pointer to 0 at 7
        let buf = [
            5, b'l', b'o', b'c', b'a', b'l', 0, 4, b'h', b'o', b's', b't', 0xC0, 0x00,
        ];
        let mut reader = Reader::new(&buf);
        reader.set_pos(7);
        let name = Name::decode(&mut reader).unwrap();
        assert_eq!(name, Name::new("host.local").unwrap());
        assert_eq!(reader.pos(), buf.len());
    }

    #[test]
    fn test_decode_rejects_self_pointer() {
        let buf = [0xC0, 0x00];
        assert_eq!(
            decode_at(&buf, 0),
            Err(DecodeError::PointerCycle { offset: 0 })
        );
    }

    #[test]
    fn test_decode_rejects_pointer_loop() {
        // 0: "a" then pointer to 4; 4: "b" then pointer back to 0
        let buf = [1, b'a', 0xC0, 0x04, 1, b'b', 0xC0, 0x00];
        assert!(matches!(
            decode_at(&buf, 4),
            Err(DecodeError::PointerCycle { .. })
        ));
        assert!(matches!(
            decode_at(&buf, 0),
            Err(DecodeError::PointerCycle { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let buf = [5, b'l', b'o'];
        assert_eq!(
            decode_at(&buf, 0),
            Err(DecodeError::BufferTruncated { offset: 0 })
        );
        let buf = [3, b'a', b'b', b'c'];
        assert_eq!(
            decode_at(&buf, 0),
            Err(DecodeError::BufferTruncated { offset: 4 })
        );
    }

    #[test]
    fn test_decode_rejects_overlong_expansion() {
        let mut buf = Vec::new();
        for _ in 0..5 {
            buf.push(63);
            buf.extend_from_slice(&[b'a'; 63]);
        }
        buf.push(0);
        assert_eq!(decode_at(&buf, 0), Err(DecodeError::NameTooLong));
    }

    #[test]
    fn test_decode_rejects_extended_label_type() {
        let buf = [0x40, 0x00];
        assert_eq!(
            decode_at(&buf, 0),
            Err(DecodeError::InvalidLabelType {
                offset: 0,
                byte: 0x40
            })
        );
    }
}
