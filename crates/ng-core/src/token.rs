use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::constants::{FIELD_RADIUS_SCALE, FIELD_STRENGTH_SCALE, SPACE_COUNT};
use crate::error::{Error, Result};
use crate::space::{CoordinateSpace, euclidean};

pub type TokenId = u32;

/// Closed set of token categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum EntityType {
    #[default]
    Concept = 0,
    State = 1,
    Event = 2,
    Action = 3,
    Object = 4,
    Relation = 5,
    Pattern = 6,
    Memory = 7,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concept => "concept",
            Self::State => "state",
            Self::Event => "event",
            Self::Action => "action",
            Self::Object => "object",
            Self::Relation => "relation",
            Self::Pattern => "pattern",
            Self::Memory => "memory",
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Concept,
            1 => Self::State,
            2 => Self::Event,
            3 => Self::Action,
            4 => Self::Object,
            5 => Self::Relation,
            6 => Self::Pattern,
            7 => Self::Memory,
            _ => return None,
        })
    }
}

const FLAG_ACTIVE: u8 = 0b0000_0001;

// Byte offsets of the fixed layout.
const OFF_ID: usize = 0;
const OFF_MASK: usize = 4;
const OFF_TYPE: usize = 5;
const OFF_FLAGS: usize = 6;
const OFF_RESERVED: usize = 7;
const OFF_COORDS: usize = 8;
const OFF_WEIGHT: usize = OFF_COORDS + SPACE_COUNT * 12;
const OFF_FIELD_RADIUS: usize = OFF_WEIGHT + 4;
const OFF_FIELD_STRENGTH: usize = OFF_FIELD_RADIUS + 2;

/// An addressable entity positioned in up to eight coordinate spaces.
///
/// A space is either fully present (x, y, z) or absent. `field_radius` and
/// `field_strength` are kept in fixed point so the binary form is exact.
///
/// Binary layout (little-endian, [`Token::SIZE`] bytes):
///
/// ```text
/// 0   id              u32
/// 4   space mask      u8    bit i set = space i present
/// 5   entity_type     u8
/// 6   flags           u8    bit0 = active
/// 7   reserved        u8    always 0
/// 8   coordinates     8 x (f32 x, f32 y, f32 z), absent spaces zeroed
/// 104 weight          f32
/// 108 field_radius    u16   hundredths
/// 110 field_strength  u16   fraction of 65535
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Token {
    id: TokenId,
    coordinates: [Option<[f32; 3]>; SPACE_COUNT],
    weight: f32,
    field_radius: u16,
    field_strength: u16,
    entity_type: EntityType,
    active: bool,
}

impl Token {
    pub const SIZE: usize = OFF_FIELD_STRENGTH + 2;

    pub fn new(id: TokenId) -> Self {
        Self {
            id,
            coordinates: [None; SPACE_COUNT],
            weight: 1.0,
            field_radius: FIELD_RADIUS_SCALE as u16,
            field_strength: u16::MAX,
            entity_type: EntityType::default(),
            active: true,
        }
    }

    pub fn with_entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = entity_type;
        self
    }

    /// Byte length of the binary form.
    pub fn size() -> usize {
        Self::SIZE
    }

    pub fn id(&self) -> TokenId {
        self.id
    }

    // --- Coordinates ---

    /// Set the position in `space`. Fails without touching state if any
    /// component lies outside the space's domain.
    pub fn set_coordinates(&mut self, space: CoordinateSpace, x: f32, y: f32, z: f32) -> Result<()> {
        space.validate_point([x, y, z])?;
        self.coordinates[space.index()] = Some([x, y, z]);
        Ok(())
    }

    pub fn clear_coordinates(&mut self, space: CoordinateSpace) {
        self.coordinates[space.index()] = None;
    }

    pub fn get_coordinates(&self, space: CoordinateSpace) -> Option<[f32; 3]> {
        self.coordinates[space.index()]
    }

    pub fn has_space(&self, space: CoordinateSpace) -> bool {
        self.coordinates[space.index()].is_some()
    }

    /// Spaces this token occupies, in level order.
    pub fn occupied_spaces(&self) -> impl Iterator<Item = CoordinateSpace> + '_ {
        CoordinateSpace::ALL
            .into_iter()
            .filter(|s| self.has_space(*s))
    }

    pub fn space_mask(&self) -> u8 {
        self.occupied_spaces()
            .fold(0u8, |mask, s| mask | (1 << s.index()))
    }

    /// Euclidean distance to `other` in a single space.
    pub fn distance_to(&self, other: &Token, space: CoordinateSpace) -> Result<f64> {
        let a = self.get_coordinates(space).ok_or(Error::MissingSpace {
            token: self.id,
            space,
        })?;
        let b = other.get_coordinates(space).ok_or(Error::MissingSpace {
            token: other.id,
            space,
        })?;
        Ok(euclidean(a, b))
    }

    // --- Properties ---

    pub fn weight(&self) -> f32 {
        self.weight
    }

    pub fn set_weight(&mut self, weight: f32) {
        self.weight = weight;
    }

    pub fn field_radius(&self) -> f32 {
        self.field_radius as f32 / FIELD_RADIUS_SCALE
    }

    /// Quantized to hundredths, clamped to [0, 655.35].
    pub fn set_field_radius(&mut self, radius: f32) {
        self.field_radius = quantize(radius, FIELD_RADIUS_SCALE);
    }

    pub fn field_strength(&self) -> f32 {
        self.field_strength as f32 / FIELD_STRENGTH_SCALE
    }

    /// Quantized to 1/65535, clamped to [0, 1].
    pub fn set_field_strength(&mut self, strength: f32) {
        self.field_strength = quantize(strength.min(1.0), FIELD_STRENGTH_SCALE);
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn set_entity_type(&mut self, entity_type: EntityType) {
        self.entity_type = entity_type;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    // --- Binary form ---

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u32(&mut buf[OFF_ID..], self.id);
        buf[OFF_MASK] = self.space_mask();
        buf[OFF_TYPE] = self.entity_type as u8;
        buf[OFF_FLAGS] = if self.active { FLAG_ACTIVE } else { 0 };
        for (i, coords) in self.coordinates.iter().enumerate() {
            if let Some(point) = coords {
                let base = OFF_COORDS + i * 12;
                for (axis, v) in point.iter().enumerate() {
                    LittleEndian::write_f32(&mut buf[base + axis * 4..], *v);
                }
            }
        }
        LittleEndian::write_f32(&mut buf[OFF_WEIGHT..], self.weight);
        LittleEndian::write_u16(&mut buf[OFF_FIELD_RADIUS..], self.field_radius);
        LittleEndian::write_u16(&mut buf[OFF_FIELD_STRENGTH..], self.field_strength);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(Error::Format(format!(
                "token expects {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let entity_type = EntityType::from_u8(bytes[OFF_TYPE])
            .ok_or_else(|| Error::Format(format!("unknown entity type {}", bytes[OFF_TYPE])))?;
        let flags = bytes[OFF_FLAGS];
        if flags & !FLAG_ACTIVE != 0 {
            return Err(Error::Format(format!("unknown token flags {flags:#04x}")));
        }
        if bytes[OFF_RESERVED] != 0 {
            return Err(Error::Format("reserved token byte is set".into()));
        }

        let mask = bytes[OFF_MASK];
        let mut coordinates = [None; SPACE_COUNT];
        for space in CoordinateSpace::ALL {
            if mask & (1 << space.index()) == 0 {
                continue;
            }
            let base = OFF_COORDS + space.index() * 12;
            let point = [
                LittleEndian::read_f32(&bytes[base..]),
                LittleEndian::read_f32(&bytes[base + 4..]),
                LittleEndian::read_f32(&bytes[base + 8..]),
            ];
            space
                .validate_point(point)
                .map_err(|e| Error::Format(format!("corrupt coordinates: {e}")))?;
            coordinates[space.index()] = Some(point);
        }

        Ok(Self {
            id: LittleEndian::read_u32(&bytes[OFF_ID..]),
            coordinates,
            weight: LittleEndian::read_f32(&bytes[OFF_WEIGHT..]),
            field_radius: LittleEndian::read_u16(&bytes[OFF_FIELD_RADIUS..]),
            field_strength: LittleEndian::read_u16(&bytes[OFF_FIELD_STRENGTH..]),
            entity_type,
            active: flags & FLAG_ACTIVE != 0,
        })
    }
}

fn quantize(value: f32, scale: f32) -> u16 {
    if value.is_nan() {
        return 0;
    }
    (value * scale).round().clamp(0.0, u16::MAX as f32) as u16
}
