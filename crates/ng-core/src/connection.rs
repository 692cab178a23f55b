use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::constants::SPACE_COUNT;
use crate::error::{Error, Result};
use crate::space::CoordinateSpace;
use crate::token::TokenId;

/// Family a connection type belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionCategory {
    Semantic,
    Causal,
    Temporal,
    Spatial,
    Logical,
    Emotional,
}

/// Closed set of relationship types. The discriminant is the wire tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionType {
    Synonym = 0,
    Antonym = 1,
    Hypernym = 2,
    Hyponym = 3,
    #[default]
    Related = 4,
    Cause = 10,
    Effect = 11,
    Enables = 12,
    Prevents = 13,
    Before = 20,
    After = 21,
    During = 22,
    Near = 30,
    Far = 31,
    Contains = 32,
    PartOf = 33,
    Implies = 40,
    Contradicts = 41,
    Equivalent = 42,
    Desires = 50,
    Fears = 51,
    Likes = 52,
}

impl ConnectionType {
    pub fn category(self) -> ConnectionCategory {
        use ConnectionType::*;
        match self {
            Synonym | Antonym | Hypernym | Hyponym | Related => ConnectionCategory::Semantic,
            Cause | Effect | Enables | Prevents => ConnectionCategory::Causal,
            Before | After | During => ConnectionCategory::Temporal,
            Near | Far | Contains | PartOf => ConnectionCategory::Spatial,
            Implies | Contradicts | Equivalent => ConnectionCategory::Logical,
            Desires | Fears | Likes => ConnectionCategory::Emotional,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        use ConnectionType::*;
        Some(match tag {
            0 => Synonym,
            1 => Antonym,
            2 => Hypernym,
            3 => Hyponym,
            4 => Related,
            10 => Cause,
            11 => Effect,
            12 => Enables,
            13 => Prevents,
            20 => Before,
            21 => After,
            22 => During,
            30 => Near,
            31 => Far,
            32 => Contains,
            33 => PartOf,
            40 => Implies,
            41 => Contradicts,
            42 => Equivalent,
            50 => Desires,
            51 => Fears,
            52 => Likes,
            _ => return None,
        })
    }
}

const FLAG_ACTIVE: u8 = 0b01;
const FLAG_BIDIRECTIONAL: u8 = 0b10;

/// Typed, weighted edge between two tokens, modelled as a spring.
///
/// Holds token ids only. Deleting a token leaves its connections in place;
/// callers decide what a dangling edge means.
///
/// Binary layout (little-endian, [`Connection::SIZE`] bytes):
///
/// ```text
/// 0   token_a             u32
/// 4   token_b             u32
/// 8   connection_type     u8
/// 9   level mask          u8
/// 10  flags               u8   bit0 = active, bit1 = bidirectional
/// 11  reserved            u8
/// 12  pull_strength       f32
/// 16  preferred_distance  f32
/// 20  rigidity            f32
/// 24  activation_count    u32
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub token_a: TokenId,
    pub token_b: TokenId,
    pub connection_type: ConnectionType,
    pub pull_strength: f32,
    pub preferred_distance: f32,
    pub rigidity: f32,
    pub active_levels: u8,
    pub activation_count: u32,
    pub bidirectional: bool,
    pub active: bool,
}

impl Connection {
    pub const SIZE: usize = 28;

    /// Bidirectional connection active in every level.
    pub fn new(token_a: TokenId, token_b: TokenId, connection_type: ConnectionType) -> Self {
        Self {
            token_a,
            token_b,
            connection_type,
            pull_strength: 1.0,
            preferred_distance: 1.0,
            rigidity: 1.0,
            active_levels: u8::MAX,
            activation_count: 0,
            bidirectional: true,
            active: true,
        }
    }

    pub fn directed(mut self) -> Self {
        self.bidirectional = false;
        self
    }

    pub fn with_spring(mut self, pull_strength: f32, preferred_distance: f32, rigidity: f32) -> Self {
        self.pull_strength = pull_strength;
        self.preferred_distance = preferred_distance;
        self.rigidity = rigidity;
        self
    }

    pub fn size() -> usize {
        Self::SIZE
    }

    /// Spring force at `distance`.
    ///
    /// Negative (push) when closer than `preferred_distance`, positive (pull)
    /// when farther, exactly zero at equilibrium.
    pub fn calculate_force(&self, distance: f64) -> f64 {
        self.pull_strength as f64 * self.rigidity as f64 * (distance - self.preferred_distance as f64)
    }

    /// Count a traversal. Strength and distance are left untouched.
    pub fn activate(&mut self) {
        self.activation_count = self.activation_count.saturating_add(1);
        self.active = true;
    }

    /// Whether the edge can be traversed from `from` to `to`.
    pub fn links(&self, from: TokenId, to: TokenId) -> bool {
        (self.token_a == from && self.token_b == to)
            || (self.bidirectional && self.token_a == to && self.token_b == from)
    }

    /// The endpoint opposite `id`, if `id` is an endpoint.
    pub fn other(&self, id: TokenId) -> Option<TokenId> {
        if self.token_a == id {
            Some(self.token_b)
        } else if self.token_b == id {
            Some(self.token_a)
        } else {
            None
        }
    }

    // --- Level mask ---

    /// Levels outside 0..8 are ignored.
    pub fn set_level_active(&mut self, level: usize, active: bool) {
        if level >= SPACE_COUNT {
            return;
        }
        if active {
            self.active_levels |= 1 << level;
        } else {
            self.active_levels &= !(1 << level);
        }
    }

    pub fn is_level_active(&self, level: usize) -> bool {
        level < SPACE_COUNT && self.active_levels & (1 << level) != 0
    }

    pub fn is_space_active(&self, space: CoordinateSpace) -> bool {
        self.is_level_active(space.index())
    }

    /// Set bit indices, ascending.
    pub fn get_active_levels(&self) -> Vec<usize> {
        (0..SPACE_COUNT).filter(|l| self.is_level_active(*l)).collect()
    }

    // --- Binary form ---

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u32(&mut buf[0..], self.token_a);
        LittleEndian::write_u32(&mut buf[4..], self.token_b);
        buf[8] = self.connection_type as u8;
        buf[9] = self.active_levels;
        let mut flags = 0;
        if self.active {
            flags |= FLAG_ACTIVE;
        }
        if self.bidirectional {
            flags |= FLAG_BIDIRECTIONAL;
        }
        buf[10] = flags;
        LittleEndian::write_f32(&mut buf[12..], self.pull_strength);
        LittleEndian::write_f32(&mut buf[16..], self.preferred_distance);
        LittleEndian::write_f32(&mut buf[20..], self.rigidity);
        LittleEndian::write_u32(&mut buf[24..], self.activation_count);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(Error::Format(format!(
                "connection expects {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let connection_type = ConnectionType::from_u8(bytes[8])
            .ok_or_else(|| Error::Format(format!("unknown connection type {}", bytes[8])))?;
        let flags = bytes[10];
        if flags & !(FLAG_ACTIVE | FLAG_BIDIRECTIONAL) != 0 {
            return Err(Error::Format(format!("unknown connection flags {flags:#04x}")));
        }
        if bytes[11] != 0 {
            return Err(Error::Format("reserved connection byte is set".into()));
        }
        Ok(Self {
            token_a: LittleEndian::read_u32(&bytes[0..]),
            token_b: LittleEndian::read_u32(&bytes[4..]),
            connection_type,
            active_levels: bytes[9],
            active: flags & FLAG_ACTIVE != 0,
            bidirectional: flags & FLAG_BIDIRECTIONAL != 0,
            pull_strength: LittleEndian::read_f32(&bytes[12..]),
            preferred_distance: LittleEndian::read_f32(&bytes[16..]),
            rigidity: LittleEndian::read_f32(&bytes[20..]),
            activation_count: LittleEndian::read_u32(&bytes[24..]),
        })
    }
}
