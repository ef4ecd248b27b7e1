use crate::wire::{Cursor, WireError, write_u32_len};

pub const REGISTER_BITS: u8 = 5;
pub const CLASS_BITS: u8 = 3;

pub const CLASS_GPR: u8 = 0;
pub const CLASS_FPR: u8 = 1;
pub const CLASS_GPR_PAIR: u8 = 2;
pub const CLASS_COMPLEX: u8 = 3;
pub const CLASS_INVALID: u8 = (1 << CLASS_BITS) - 1;
pub const REGISTER_INVALID: u8 = (1 << REGISTER_BITS) - 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegAllocError {
    RegisterOutOfRange(u8),
    ClassOutOfRange(u8),
    NodeOutOfRange { node: u32, count: u32 },
    InvalidSharedFlag(u8),
    TrailingBytes,
    Wire(WireError),
}

impl std::fmt::Display for RegAllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegAllocError::RegisterOutOfRange(reg) => {
                write!(f, "register index {reg} does not fit in {REGISTER_BITS} bits")
            }
            RegAllocError::ClassOutOfRange(class) => {
                write!(f, "register class {class} does not fit in {CLASS_BITS} bits")
            }
            RegAllocError::NodeOutOfRange { node, count } => {
                write!(f, "node {node} outside allocation map of {count} entries")
            }
            RegAllocError::InvalidSharedFlag(value) => {
                write!(f, "invalid shared flag in serialized allocation: {value}")
            }
            RegAllocError::TrailingBytes => write!(f, "trailing bytes after allocation map"),
            RegAllocError::Wire(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RegAllocError {}

impl From<WireError> for RegAllocError {
    fn from(err: WireError) -> Self {
        RegAllocError::Wire(err)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalRegister(u8);

impl PhysicalRegister {
    pub const INVALID: PhysicalRegister =
        PhysicalRegister(REGISTER_INVALID | (CLASS_INVALID << REGISTER_BITS));

    pub fn new(class: u8, reg: u8) -> Result<Self, RegAllocError> {
        if reg > REGISTER_INVALID {
            return Err(RegAllocError::RegisterOutOfRange(reg));
        }
        if class > CLASS_INVALID {
            return Err(RegAllocError::ClassOutOfRange(class));
        }
        Ok(Self(reg | (class << REGISTER_BITS)))
    }

    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn reg(self) -> u8 {
        self.0 & REGISTER_INVALID
    }

    pub const fn class(self) -> u8 {
        self.0 >> REGISTER_BITS
    }

    pub fn is_invalid(self) -> bool {
        self == Self::INVALID
    }
}

impl std::fmt::Debug for PhysicalRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_invalid() {
            return f.write_str("PhysicalRegister(invalid)");
        }
        write!(f, "PhysicalRegister(class={}, reg={})", self.class(), self.reg())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterAllocationData {
    pub spill_slot_count: u32,
    map: Vec<PhysicalRegister>,
}

impl RegisterAllocationData {
    pub fn new(node_count: u32) -> Self {
        Self {
            spill_slot_count: 0,
            map: vec![PhysicalRegister::INVALID; node_count as usize],
        }
    }

    pub fn node_count(&self) -> u32 {
        self.map.len() as u32
    }

    pub fn node_register(&self, node: u32) -> Option<PhysicalRegister> {
        self.map.get(node as usize).copied()
    }

    pub fn set_node_register(
        &mut self,
        node: u32,
        register: PhysicalRegister,
    ) -> Result<(), RegAllocError> {
        let count = self.node_count();
        let slot = self
            .map
            .get_mut(node as usize)
            .ok_or(RegAllocError::NodeOutOfRange { node, count })?;
        *slot = register;
        Ok(())
    }

    pub fn encoded_len(&self) -> usize {
        4 + 4 + 1 + self.map.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, RegAllocError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.spill_slot_count.to_le_bytes());
        write_u32_len("register map", self.map.len(), &mut out)?;
        out.push(1);
        out.extend(self.map.iter().map(|register| register.raw()));
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RegAllocError> {
        let mut cursor = Cursor::new(bytes);
        let spill_slot_count = cursor.read_u32()?;
        let count = cursor.read_u32()? as usize;
        let shared = cursor.read_u8()?;
        if shared != 1 {
            return Err(RegAllocError::InvalidSharedFlag(shared));
        }
        let map = cursor
            .read_exact(count)?
            .iter()
            .map(|raw| PhysicalRegister::from_raw(*raw))
            .collect();
        if !cursor.is_eof() {
            return Err(RegAllocError::TrailingBytes);
        }
        Ok(Self {
            spill_slot_count,
            map,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packing_validates_field_widths() {
        let reg = PhysicalRegister::new(CLASS_FPR, 17).expect("fits");
        assert_eq!(reg.raw(), 17 | (1 << 5));
        assert_eq!((reg.class(), reg.reg()), (CLASS_FPR, 17));
        assert_eq!(
            PhysicalRegister::new(CLASS_GPR, 32),
            Err(RegAllocError::RegisterOutOfRange(32))
        );
        assert_eq!(
            PhysicalRegister::new(8, 0),
            Err(RegAllocError::ClassOutOfRange(8))
        );
        assert_eq!(PhysicalRegister::INVALID.raw(), 0xFF);
        assert!(
            PhysicalRegister::new(CLASS_INVALID, REGISTER_INVALID)
                .expect("fits")
                .is_invalid()
        );
    }

    #[test]
    fn serialized_layout_sets_shared_flag() {
        let mut data = RegisterAllocationData::new(3);
        data.spill_slot_count = 2;
        data.set_node_register(1, PhysicalRegister::new(CLASS_GPR, 4).expect("fits"))
            .expect("node exists");
        let bytes = data.encode().expect("encodes");
        assert_eq!(bytes, vec![2, 0, 0, 0, 3, 0, 0, 0, 1, 0xFF, 4, 0xFF]);
        assert_eq!(bytes.len(), data.encoded_len());

        let decoded = RegisterAllocationData::decode(&bytes).expect("decodes");
        assert_eq!(decoded, data);
        assert_eq!(
            decoded.node_register(1),
            Some(PhysicalRegister::new(CLASS_GPR, 4).expect("fits"))
        );
        assert_eq!(decoded.node_register(3), None);
    }

    #[test]
    fn decode_rejects_malformed_input() {
        assert_eq!(
            RegisterAllocationData::decode(&[0, 0, 0, 0, 1, 0, 0, 0, 0, 5]),
            Err(RegAllocError::InvalidSharedFlag(0))
        );
        assert_eq!(
            RegisterAllocationData::decode(&[0, 0, 0, 0, 2, 0, 0, 0, 1, 5]),
            Err(RegAllocError::Wire(WireError::UnexpectedEof))
        );
        assert_eq!(
            RegisterAllocationData::decode(&[0, 0, 0, 0, 0, 0, 0, 0, 1, 5]),
            Err(RegAllocError::TrailingBytes)
        );

        let mut data = RegisterAllocationData::new(1);
        assert_eq!(
            data.set_node_register(4, PhysicalRegister::INVALID),
            Err(RegAllocError::NodeOutOfRange { node: 4, count: 1 })
        );
    }
}
