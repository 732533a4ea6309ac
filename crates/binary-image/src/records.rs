//! On-disk record layouts
//!
//! Every record is fixed-width little-endian with pointer fields replaced
//! by `u64` array indices; [`NULL_INDEX`] encodes a null edge. Bit-packed
//! flag words keep the layouts stable across platforms.

use std::io::{Read, Write};

/// File magic.
pub const IMAGE_MAGIC: [u8; 4] = *b"PNET";

/// Image format version.
pub const IMAGE_VERSION: u32 = 1;

/// Index encoding of a null pointer.
pub const NULL_INDEX: u64 = u64::MAX;

/// Image save/load failure
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// Underlying stream failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream does not start with the image magic
    #[error("bad image magic")]
    BadMagic,

    /// Image version newer than this reader understands
    #[error("unsupported image version {0}")]
    UnsupportedVersion(u32),

    /// The stream ended inside a record
    #[error("truncated image")]
    Truncated,

    /// A record carried an invalid tag or field
    #[error("malformed record: {0}")]
    BadRecord(&'static str),

    /// An index field points outside its table
    #[error("dangling index {index} into {table}")]
    DanglingIndex {
        /// Offending index value
        index: u64,
        /// Table the index was resolved against
        table: &'static str,
    },
}

/// Result alias for image operations
pub type ImageResult<T> = Result<T, ImageError>;

/// Little-endian field writer over any stream
pub struct FieldWriter<W: Write> {
    out: W,
}

impl<W: Write> FieldWriter<W> {
    /// Wrap a stream.
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Unwrap the stream.
    pub fn into_inner(self) -> W {
        self.out
    }

    pub(crate) fn put_u8(&mut self, v: u8) -> ImageResult<()> {
        Ok(self.out.write_all(&[v])?)
    }

    pub(crate) fn put_u16(&mut self, v: u16) -> ImageResult<()> {
        Ok(self.out.write_all(&v.to_le_bytes())?)
    }

    pub(crate) fn put_u32(&mut self, v: u32) -> ImageResult<()> {
        Ok(self.out.write_all(&v.to_le_bytes())?)
    }

    pub(crate) fn put_u64(&mut self, v: u64) -> ImageResult<()> {
        Ok(self.out.write_all(&v.to_le_bytes())?)
    }

    pub(crate) fn put_i16(&mut self, v: i16) -> ImageResult<()> {
        Ok(self.out.write_all(&v.to_le_bytes())?)
    }

    pub(crate) fn put_i32(&mut self, v: i32) -> ImageResult<()> {
        Ok(self.out.write_all(&v.to_le_bytes())?)
    }

    pub(crate) fn put_i64(&mut self, v: i64) -> ImageResult<()> {
        Ok(self.out.write_all(&v.to_le_bytes())?)
    }

    pub(crate) fn put_str(&mut self, s: &str) -> ImageResult<()> {
        self.put_u32(s.len() as u32)?;
        Ok(self.out.write_all(s.as_bytes())?)
    }
}

/// Little-endian field reader over any stream
pub struct FieldReader<R: Read> {
    input: R,
}

impl<R: Read> FieldReader<R> {
    /// Wrap a stream.
    pub fn new(input: R) -> Self {
        Self { input }
    }

    fn fill(&mut self, buf: &mut [u8]) -> ImageResult<()> {
        self.input.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ImageError::Truncated
            } else {
                ImageError::Io(e)
            }
        })
    }

    pub(crate) fn take_u8(&mut self) -> ImageResult<u8> {
        let mut buf = [0u8; 1];
        self.fill(&mut buf)?;
        Ok(buf[0])
    }

    pub(crate) fn take_u16(&mut self) -> ImageResult<u16> {
        let mut buf = [0u8; 2];
        self.fill(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub(crate) fn take_u32(&mut self) -> ImageResult<u32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub(crate) fn take_u64(&mut self) -> ImageResult<u64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn take_i16(&mut self) -> ImageResult<i16> {
        let mut buf = [0u8; 2];
        self.fill(&mut buf)?;
        Ok(i16::from_le_bytes(buf))
    }

    pub(crate) fn take_i32(&mut self) -> ImageResult<i32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub(crate) fn take_i64(&mut self) -> ImageResult<i64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    pub(crate) fn take_string(&mut self) -> ImageResult<String> {
        let len = self.take_u32()? as usize;
        let mut buf = vec![0u8; len];
        self.fill(&mut buf)?;
        String::from_utf8(buf).map_err(|_| ImageError::BadRecord("non-utf8 string"))
    }
}

/// Shared header of every pattern node record
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BsavePatternNodeHeader {
    /// First join entered from this node's alpha memory
    pub entry_join: u64,
    /// Alpha-memory bucket hash expression
    pub right_hash: u64,
    /// Packed flags: singlefield, multifield, stop, blocked, initialize,
    /// marked, begin_slot, end_slot, selector (bits 0..=8)
    pub flags: u16,
}

impl BsavePatternNodeHeader {
    pub(crate) fn write<W: Write>(&self, w: &mut FieldWriter<W>) -> ImageResult<()> {
        w.put_u64(self.entry_join)?;
        w.put_u64(self.right_hash)?;
        w.put_u16(self.flags)
    }

    pub(crate) fn read<R: Read>(r: &mut FieldReader<R>) -> ImageResult<Self> {
        Ok(Self {
            entry_join: r.take_u64()?,
            right_hash: r.take_u64()?,
            flags: r.take_u16()?,
        })
    }
}

/// Pattern node record
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BsaveFactPatternNode {
    /// Shared header
    pub header: BsavePatternNodeHeader,
    /// Slot under test
    pub which_slot: u16,
    /// Field position within the slot
    pub which_field: u16,
    /// Trailing fields a multifield span must leave
    pub leave_fields: u16,
    /// Test table index
    pub network_test: u64,
    /// Child index
    pub next_level: u64,
    /// Parent index
    pub last_level: u64,
    /// Previous sibling index
    pub left_node: u64,
    /// Next sibling index
    pub right_node: u64,
    /// Slot bitmap (or [`NULL_INDEX`])
    pub modify_slots: u64,
}

impl BsaveFactPatternNode {
    pub(crate) fn write<W: Write>(&self, w: &mut FieldWriter<W>) -> ImageResult<()> {
        self.header.write(w)?;
        w.put_u16(self.which_slot)?;
        w.put_u16(self.which_field)?;
        w.put_u16(self.leave_fields)?;
        w.put_u64(self.network_test)?;
        w.put_u64(self.next_level)?;
        w.put_u64(self.last_level)?;
        w.put_u64(self.left_node)?;
        w.put_u64(self.right_node)?;
        w.put_u64(self.modify_slots)
    }

    pub(crate) fn read<R: Read>(r: &mut FieldReader<R>) -> ImageResult<Self> {
        Ok(Self {
            header: BsavePatternNodeHeader::read(r)?,
            which_slot: r.take_u16()?,
            which_field: r.take_u16()?,
            leave_fields: r.take_u16()?,
            network_test: r.take_u64()?,
            next_level: r.take_u64()?,
            last_level: r.take_u64()?,
            left_node: r.take_u64()?,
            right_node: r.take_u64()?,
            modify_slots: r.take_u64()?,
        })
    }

    /// Record width in bytes.
    pub const WIDTH: u64 = 18 + 6 + 48;
}

/// Join node record
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BsaveJoinNode {
    /// Packed word: first_join, logical_join, goal_join, explicit_join,
    /// join_from_the_right, pattern_is_negated, pattern_is_exists
    /// (bits 0..=6), rhs_type (bits 7..=9), depth (bits 10..=16)
    pub flags_depth: u32,
    /// Test table index
    pub network_test: u64,
    /// Test table index
    pub secondary_network_test: u64,
    /// Test table index
    pub goal_expression: u64,
    /// Test table index
    pub left_hash: u64,
    /// Test table index
    pub right_hash: u64,
    /// Pattern node or join index, per `join_from_the_right`
    pub right_side_entry_structure: u64,
    /// Link table index of the first downward link
    pub next_links: u64,
    /// Parent join index
    pub last_level: u64,
    /// Next join on the same alpha memory
    pub right_match_node: u64,
    /// Rule table index
    pub rule_to_activate: u64,
}

impl BsaveJoinNode {
    pub(crate) fn write<W: Write>(&self, w: &mut FieldWriter<W>) -> ImageResult<()> {
        w.put_u32(self.flags_depth)?;
        w.put_u64(self.network_test)?;
        w.put_u64(self.secondary_network_test)?;
        w.put_u64(self.goal_expression)?;
        w.put_u64(self.left_hash)?;
        w.put_u64(self.right_hash)?;
        w.put_u64(self.right_side_entry_structure)?;
        w.put_u64(self.next_links)?;
        w.put_u64(self.last_level)?;
        w.put_u64(self.right_match_node)?;
        w.put_u64(self.rule_to_activate)
    }

    pub(crate) fn read<R: Read>(r: &mut FieldReader<R>) -> ImageResult<Self> {
        Ok(Self {
            flags_depth: r.take_u32()?,
            network_test: r.take_u64()?,
            secondary_network_test: r.take_u64()?,
            goal_expression: r.take_u64()?,
            left_hash: r.take_u64()?,
            right_hash: r.take_u64()?,
            right_side_entry_structure: r.take_u64()?,
            next_links: r.take_u64()?,
            last_level: r.take_u64()?,
            right_match_node: r.take_u64()?,
            rule_to_activate: r.take_u64()?,
        })
    }

    /// Record width in bytes.
    pub const WIDTH: u64 = 4 + 80;
}

/// Join link record: one element of a chained link list
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BsaveJoinLink {
    /// Entry side: `b'L'` or `b'R'`
    pub enter_direction: u8,
    /// Target join index
    pub join: u64,
    /// Next link in the chain
    pub next: u64,
}

impl BsaveJoinLink {
    pub(crate) fn write<W: Write>(&self, w: &mut FieldWriter<W>) -> ImageResult<()> {
        w.put_u8(self.enter_direction)?;
        w.put_u64(self.join)?;
        w.put_u64(self.next)
    }

    pub(crate) fn read<R: Read>(r: &mut FieldReader<R>) -> ImageResult<Self> {
        Ok(Self {
            enter_direction: r.take_u8()?,
            join: r.take_u64()?,
            next: r.take_u64()?,
        })
    }

    /// Record width in bytes.
    pub const WIDTH: u64 = 1 + 16;
}

/// Rule record
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BsaveDefrule {
    /// Name table index
    pub name: u32,
    /// Agenda salience
    pub salience: i32,
    /// Local variable count
    pub local_var_cnt: u16,
    /// Packed word: complexity (bits 0..=11), auto_focus (bit 12)
    pub complexity_flags: u16,
    /// Certainty factor
    pub certainty: i16,
    /// Expression table index (dynamic salience)
    pub dynamic_salience: u64,
    /// Expression table index (RHS actions)
    pub actions: u64,
    /// Join index of the logical group's last join
    pub logical_join: u64,
    /// Join index of the terminal join
    pub last_join: u64,
    /// Rule index of the next disjunct
    pub disjunct: u64,
}

impl BsaveDefrule {
    pub(crate) fn write<W: Write>(&self, w: &mut FieldWriter<W>) -> ImageResult<()> {
        w.put_u32(self.name)?;
        w.put_i32(self.salience)?;
        w.put_u16(self.local_var_cnt)?;
        w.put_u16(self.complexity_flags)?;
        w.put_i16(self.certainty)?;
        w.put_u64(self.dynamic_salience)?;
        w.put_u64(self.actions)?;
        w.put_u64(self.logical_join)?;
        w.put_u64(self.last_join)?;
        w.put_u64(self.disjunct)
    }

    pub(crate) fn read<R: Read>(r: &mut FieldReader<R>) -> ImageResult<Self> {
        Ok(Self {
            name: r.take_u32()?,
            salience: r.take_i32()?,
            local_var_cnt: r.take_u16()?,
            complexity_flags: r.take_u16()?,
            certainty: r.take_i16()?,
            dynamic_salience: r.take_u64()?,
            actions: r.take_u64()?,
            logical_join: r.take_u64()?,
            last_join: r.take_u64()?,
            disjunct: r.take_u64()?,
        })
    }

    /// Record width in bytes.
    pub const WIDTH: u64 = 4 + 4 + 2 + 2 + 2 + 40;
}

/// Encode an optional index.
pub(crate) fn index_of(value: Option<u64>) -> u64 {
    value.unwrap_or(NULL_INDEX)
}

/// Decode an optional index with a bounds check.
pub(crate) fn checked_index(
    value: u64,
    len: usize,
    table: &'static str,
) -> ImageResult<Option<usize>> {
    if value == NULL_INDEX {
        return Ok(None);
    }
    if (value as usize) < len {
        Ok(Some(value as usize))
    } else {
        Err(ImageError::DanglingIndex {
            index: value,
            table,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_node_round_trip() {
        let record = BsaveJoinNode {
            flags_depth: 0b101 | (3 << 7) | (9 << 10),
            network_test: 7,
            secondary_network_test: NULL_INDEX,
            goal_expression: NULL_INDEX,
            left_hash: 2,
            right_hash: 3,
            right_side_entry_structure: 1,
            next_links: 0,
            last_level: NULL_INDEX,
            right_match_node: NULL_INDEX,
            rule_to_activate: 4,
        };
        let mut w = FieldWriter::new(Vec::new());
        record.write(&mut w).unwrap();
        let bytes = w.into_inner();
        assert_eq!(bytes.len() as u64, BsaveJoinNode::WIDTH);

        let mut r = FieldReader::new(bytes.as_slice());
        assert_eq!(BsaveJoinNode::read(&mut r).unwrap(), record);
    }

    #[test]
    fn test_pattern_node_width() {
        let record = BsaveFactPatternNode::default();
        let mut w = FieldWriter::new(Vec::new());
        record.write(&mut w).unwrap();
        assert_eq!(w.into_inner().len() as u64, BsaveFactPatternNode::WIDTH);
    }

    #[test]
    fn test_defrule_width_and_round_trip() {
        let record = BsaveDefrule {
            name: 0,
            salience: -5,
            local_var_cnt: 2,
            complexity_flags: 3 | (1 << 12),
            certainty: 9000,
            dynamic_salience: NULL_INDEX,
            actions: NULL_INDEX,
            logical_join: 1,
            last_join: 2,
            disjunct: NULL_INDEX,
        };
        let mut w = FieldWriter::new(Vec::new());
        record.write(&mut w).unwrap();
        let bytes = w.into_inner();
        assert_eq!(bytes.len() as u64, BsaveDefrule::WIDTH);

        let mut r = FieldReader::new(bytes.as_slice());
        assert_eq!(BsaveDefrule::read(&mut r).unwrap(), record);
    }

    #[test]
    fn test_truncated_read() {
        let mut r = FieldReader::new(&[1u8, 2][..]);
        assert!(matches!(r.take_u64(), Err(ImageError::Truncated)));
    }

    #[test]
    fn test_checked_index() {
        assert_eq!(checked_index(NULL_INDEX, 3, "joins").unwrap(), None);
        assert_eq!(checked_index(2, 3, "joins").unwrap(), Some(2));
        assert!(checked_index(3, 3, "joins").is_err());
    }
}
