//! Fixed-width store records
//!
//! Every entity class is persisted as fixed-size records keyed by their
//! numeric id. Integers are little-endian on disk. `u32::MAX` marks the
//! absence of a reference.

/// Nil value for record pointers
pub const NO_REFERENCE: u32 = u32::MAX;

/// A fixed-width record that can be stored in a record file
pub trait Record: Sized + Clone {
    /// On-disk size of one record in bytes
    const SIZE: usize;

    /// Whether this slot currently holds a live record
    fn in_use(&self) -> bool;

    /// Serialize into exactly `Self::SIZE` bytes
    fn to_bytes(&self, buf: &mut [u8]);

    /// Parse from exactly `Self::SIZE` bytes
    fn from_bytes(buf: &[u8]) -> Self;

    /// An unused slot, written when a record is released
    fn unused() -> Self;
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn write_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

fn write_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// Node record: head of the relationship chain and the property chain
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeRecord {
    pub in_use: bool,
    pub first_rel: u32,
    pub first_prop: u32,
}

impl Record for NodeRecord {
    const SIZE: usize = 9;

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn to_bytes(&self, buf: &mut [u8]) {
        buf[0] = self.in_use as u8;
        write_u32(buf, 1, self.first_rel);
        write_u32(buf, 5, self.first_prop);
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            in_use: buf[0] != 0,
            first_rel: read_u32(buf, 1),
            first_prop: read_u32(buf, 5),
        }
    }

    fn unused() -> Self {
        Self {
            in_use: false,
            first_rel: NO_REFERENCE,
            first_prop: NO_REFERENCE,
        }
    }
}

/// Relationship record: endpoints, type, and the two doubly linked
/// relationship chains it participates in (one per endpoint)
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RelationshipRecord {
    pub in_use: bool,
    pub start_node: u32,
    pub end_node: u32,
    pub type_id: u32,
    pub start_prev: u32,
    pub start_next: u32,
    pub end_prev: u32,
    pub end_next: u32,
    pub first_prop: u32,
}

impl Record for RelationshipRecord {
    const SIZE: usize = 33;

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn to_bytes(&self, buf: &mut [u8]) {
        buf[0] = self.in_use as u8;
        write_u32(buf, 1, self.start_node);
        write_u32(buf, 5, self.end_node);
        write_u32(buf, 9, self.type_id);
        write_u32(buf, 13, self.start_prev);
        write_u32(buf, 17, self.start_next);
        write_u32(buf, 21, self.end_prev);
        write_u32(buf, 25, self.end_next);
        write_u32(buf, 29, self.first_prop);
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            in_use: buf[0] != 0,
            start_node: read_u32(buf, 1),
            end_node: read_u32(buf, 5),
            type_id: read_u32(buf, 9),
            start_prev: read_u32(buf, 13),
            start_next: read_u32(buf, 17),
            end_prev: read_u32(buf, 21),
            end_next: read_u32(buf, 25),
            first_prop: read_u32(buf, 29),
        }
    }

    fn unused() -> Self {
        Self {
            in_use: false,
            start_node: NO_REFERENCE,
            end_node: NO_REFERENCE,
            type_id: NO_REFERENCE,
            start_prev: NO_REFERENCE,
            start_next: NO_REFERENCE,
            end_prev: NO_REFERENCE,
            end_next: NO_REFERENCE,
            first_prop: NO_REFERENCE,
        }
    }
}

/// Discriminant for the inline/spilled property payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum PropertyKind {
    Bool = 0,
    Int = 1,
    Float = 2,
    /// Payload is the head block id in the strings store
    String = 3,
    /// Payload is the head block id in the arrays store
    IntArray = 4,
}

impl PropertyKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Bool),
            1 => Some(Self::Int),
            2 => Some(Self::Float),
            3 => Some(Self::String),
            4 => Some(Self::IntArray),
            _ => None,
        }
    }
}

/// Property record: one key/value pair in a node's or relationship's
/// singly linked property chain
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PropertyRecord {
    pub in_use: bool,
    pub key_id: u32,
    pub kind: PropertyKind,
    /// Inline value (bool/int/float bits) or head block id of a dynamic chain
    pub payload: u64,
    pub next_prop: u32,
}

impl Record for PropertyRecord {
    const SIZE: usize = 18;

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn to_bytes(&self, buf: &mut [u8]) {
        buf[0] = self.in_use as u8;
        write_u32(buf, 1, self.key_id);
        buf[5] = self.kind as u8;
        write_u64(buf, 6, self.payload);
        write_u32(buf, 14, self.next_prop);
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            in_use: buf[0] != 0,
            key_id: read_u32(buf, 1),
            kind: PropertyKind::from_u8(buf[5]).unwrap_or(PropertyKind::Bool),
            payload: read_u64(buf, 6),
            next_prop: read_u32(buf, 14),
        }
    }

    fn unused() -> Self {
        Self {
            in_use: false,
            key_id: NO_REFERENCE,
            kind: PropertyKind::Bool,
            payload: 0,
            next_prop: NO_REFERENCE,
        }
    }
}

/// Payload bytes per dynamic block
pub const DYNAMIC_BLOCK_DATA: usize = 120;

/// Dynamic record: one block of a spilled string or array value
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DynamicRecord {
    pub in_use: bool,
    /// Bytes used in this block
    pub length: u32,
    pub next_block: u32,
    pub data: Vec<u8>,
}

impl Record for DynamicRecord {
    const SIZE: usize = 9 + DYNAMIC_BLOCK_DATA;

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn to_bytes(&self, buf: &mut [u8]) {
        buf[0] = self.in_use as u8;
        write_u32(buf, 1, self.length);
        write_u32(buf, 5, self.next_block);
        let data_out = &mut buf[9..9 + DYNAMIC_BLOCK_DATA];
        data_out.fill(0);
        data_out[..self.data.len()].copy_from_slice(&self.data);
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let length = read_u32(buf, 1);
        let used = (length as usize).min(DYNAMIC_BLOCK_DATA);
        Self {
            in_use: buf[0] != 0,
            length,
            next_block: read_u32(buf, 5),
            data: buf[9..9 + used].to_vec(),
        }
    }

    fn unused() -> Self {
        Self {
            in_use: false,
            length: 0,
            next_block: NO_REFERENCE,
            data: Vec::new(),
        }
    }
}

/// What a name token names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum TokenKind {
    RelationshipType = 0,
    PropertyKey = 1,
}

/// Name-token record: relationship type and property key names share one
/// small table, cached fully in memory after open. The name itself is a
/// dynamic-block chain in the strings store, so names have no length cap.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenRecord {
    pub in_use: bool,
    pub kind: TokenKind,
    /// Head block of the name chain in the strings store
    pub name_block: u32,
}

impl Record for TokenRecord {
    const SIZE: usize = 6;

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn to_bytes(&self, buf: &mut [u8]) {
        buf[0] = self.in_use as u8;
        buf[1] = self.kind as u8;
        write_u32(buf, 2, self.name_block);
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            in_use: buf[0] != 0,
            kind: if buf[1] == 1 {
                TokenKind::PropertyKey
            } else {
                TokenKind::RelationshipType
            },
            name_block: read_u32(buf, 2),
        }
    }

    fn unused() -> Self {
        Self {
            in_use: false,
            kind: TokenKind::RelationshipType,
            name_block: NO_REFERENCE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_record_round_trip() {
        let rec = NodeRecord {
            in_use: true,
            first_rel: 42,
            first_prop: NO_REFERENCE,
        };
        let mut buf = [0u8; NodeRecord::SIZE];
        rec.to_bytes(&mut buf);
        assert_eq!(NodeRecord::from_bytes(&buf), rec);
    }

    #[test]
    fn relationship_record_round_trip() {
        let rec = RelationshipRecord {
            in_use: true,
            start_node: 1,
            end_node: 2,
            type_id: 0,
            start_prev: NO_REFERENCE,
            start_next: 9,
            end_prev: 4,
            end_next: NO_REFERENCE,
            first_prop: 77,
        };
        let mut buf = [0u8; RelationshipRecord::SIZE];
        rec.to_bytes(&mut buf);
        assert_eq!(RelationshipRecord::from_bytes(&buf), rec);
    }

    #[test]
    fn property_record_inline_int() {
        let rec = PropertyRecord {
            in_use: true,
            key_id: 3,
            kind: PropertyKind::Int,
            payload: (-5i64) as u64,
            next_prop: NO_REFERENCE,
        };
        let mut buf = [0u8; PropertyRecord::SIZE];
        rec.to_bytes(&mut buf);
        let back = PropertyRecord::from_bytes(&buf);
        assert_eq!(back.payload as i64, -5);
        assert_eq!(back.kind, PropertyKind::Int);
    }

    #[test]
    fn dynamic_record_pads_block() {
        let rec = DynamicRecord {
            in_use: true,
            length: 3,
            next_block: NO_REFERENCE,
            data: vec![1, 2, 3],
        };
        let mut buf = [0u8; DynamicRecord::SIZE];
        rec.to_bytes(&mut buf);
        let back = DynamicRecord::from_bytes(&buf);
        assert_eq!(back.data, vec![1, 2, 3]);
        assert_eq!(back.next_block, NO_REFERENCE);
    }

    #[test]
    fn token_record_round_trip() {
        let rec = TokenRecord {
            in_use: true,
            kind: TokenKind::PropertyKey,
            name_block: 93,
        };
        let mut buf = [0u8; TokenRecord::SIZE];
        rec.to_bytes(&mut buf);
        let back = TokenRecord::from_bytes(&buf);
        assert_eq!(back, rec);
        assert!(!TokenRecord::unused().in_use);
    }
}
