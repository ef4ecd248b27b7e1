use std::fmt::Write;

use cache_abi::{COOKIE_LEN, SERIALIZATION_CONFIG_LEN, THUNK_HASH_LEN};

use crate::arch::HostArch;
use crate::format::{CacheRecord, CodeFragment, FormatCookie, GuestRange, SerializationConfig};
use crate::reloc::{
    NamedSymbol, Relocation, RelocationError, RelocationKind, ThunkHash, guest_address,
    validate_relocations,
};

// [guest_entry u64][data_offset u64][data_len u64]
pub const INDEX_ENTRY_LEN: usize = 24;
pub const INDEX_HEADER_LEN: usize = COOKIE_LEN + SERIALIZATION_CONFIG_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    UnexpectedEof,
    CookieMismatch {
        expected: FormatCookie,
        found: FormatCookie,
    },
    UnknownRelocationKind(u8),
    UnknownNamedSymbol(u32),
    UnknownSerializationConfig,
    SerializationMismatch {
        expected: SerializationConfig,
        found: SerializationConfig,
    },
    EmptyRanges,
    InvalidRange { begin: u64, end: u64 },
    InvalidRelocation(RelocationError),
    LengthTooLarge(&'static str, usize),
    TruncatedIndex(usize),
    DataOutOfBounds {
        guest_entry: u64,
        data_offset: u64,
        data_len: u64,
    },
    TrailingBytes,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::UnexpectedEof => write!(f, "unexpected end of input"),
            WireError::CookieMismatch { expected, found } => {
                write!(f, "format cookie mismatch: expected {expected}, found {found}")
            }
            WireError::UnknownRelocationKind(tag) => {
                write!(f, "unknown relocation kind tag: {tag}")
            }
            WireError::UnknownNamedSymbol(id) => write!(f, "unknown named symbol id: {id}"),
            WireError::UnknownSerializationConfig => {
                write!(f, "unrecognized serialization config in index header")
            }
            WireError::SerializationMismatch { expected, found } => write!(
                f,
                "serialization config mismatch: expected {expected}, found {found}"
            ),
            WireError::EmptyRanges => write!(f, "record covers no guest range"),
            WireError::InvalidRange { begin, end } => {
                write!(f, "invalid guest range [{begin:#x}, {end:#x})")
            }
            WireError::InvalidRelocation(err) => write!(f, "invalid relocation: {err}"),
            WireError::LengthTooLarge(field, len) => {
                write!(f, "{field} length too large: {len}")
            }
            WireError::TruncatedIndex(len) => {
                write!(f, "index length {len} is not a whole number of entries")
            }
            WireError::DataOutOfBounds {
                guest_entry,
                data_offset,
                data_len,
            } => write!(
                f,
                "index entry {guest_entry:#x} points outside the data file ({data_len} bytes at {data_offset})",
            ),
            WireError::TrailingBytes => write!(f, "trailing bytes after record payload"),
        }
    }
}

impl std::error::Error for WireError {}

pub type WireResult<T> = Result<T, WireError>;

pub fn encode_record(record: &CacheRecord) -> WireResult<Vec<u8>> {
    let fragment = &record.fragment;
    let mut out = Vec::with_capacity(
        12 + record.ranges.len() * 16 + fragment.code.len() + fragment.relocations.len() * 16,
    );

    write_u32_len("ranges", record.ranges.len(), &mut out)?;
    for range in &record.ranges {
        out.extend_from_slice(&range.begin.to_le_bytes());
        out.extend_from_slice(&range.end.to_le_bytes());
    }

    write_u32_len("code", fragment.code.len(), &mut out)?;
    out.extend_from_slice(&fragment.code);

    write_u32_len("relocations", fragment.relocations.len(), &mut out)?;
    for relocation in &fragment.relocations {
        encode_relocation(relocation, &mut out);
    }
    Ok(out)
}

fn encode_relocation(relocation: &Relocation, out: &mut Vec<u8>) {
    out.push(relocation.kind().tag());
    out.extend_from_slice(&relocation.offset().to_le_bytes());
    match relocation {
        Relocation::NamedSymbolLiteral { symbol, .. } => {
            out.extend_from_slice(&symbol.id().to_le_bytes());
        }
        Relocation::GuestAddressLiteral { delta, .. } => {
            out.extend_from_slice(&delta.to_le_bytes());
        }
        Relocation::NamedThunkMove { hash, register, .. } => {
            out.extend_from_slice(hash.as_bytes());
            out.push(*register);
        }
        Relocation::GuestAddressMove {
            delta, register, ..
        } => {
            out.extend_from_slice(&delta.to_le_bytes());
            out.push(*register);
        }
    }
}

pub fn decode_record(arch: HostArch, bytes: &[u8]) -> WireResult<CacheRecord> {
    let mut cursor = Cursor::new(bytes);

    let range_count = cursor.read_u32()? as usize;
    if range_count == 0 {
        return Err(WireError::EmptyRanges);
    }
    let mut ranges = Vec::with_capacity(range_count.min(bytes.len() / 16));
    for _ in 0..range_count {
        let begin = cursor.read_u64()?;
        let end = cursor.read_u64()?;
        if end <= begin {
            return Err(WireError::InvalidRange { begin, end });
        }
        ranges.push(GuestRange::new(begin, end));
    }

    let code_len = cursor.read_u32()? as usize;
    let code = cursor.read_exact(code_len)?.to_vec();

    let relocation_count = cursor.read_u32()? as usize;
    let mut relocations = Vec::with_capacity(relocation_count.min(bytes.len()));
    for _ in 0..relocation_count {
        relocations.push(decode_relocation(&mut cursor)?);
    }

    if !cursor.is_eof() {
        return Err(WireError::TrailingBytes);
    }
    validate_relocations(arch, code.len(), &relocations).map_err(WireError::InvalidRelocation)?;

    Ok(CacheRecord::new(ranges, CodeFragment::new(code, relocations)))
}

fn decode_relocation(cursor: &mut Cursor<'_>) -> WireResult<Relocation> {
    let tag = cursor.read_u8()?;
    let kind = RelocationKind::from_tag(tag).ok_or(WireError::UnknownRelocationKind(tag))?;
    let offset = cursor.read_u32()?;
    Ok(match kind {
        RelocationKind::NamedSymbolLiteral => {
            let id = cursor.read_u32()?;
            let symbol = NamedSymbol::from_id(id).ok_or(WireError::UnknownNamedSymbol(id))?;
            Relocation::NamedSymbolLiteral { offset, symbol }
        }
        RelocationKind::GuestAddressLiteral => Relocation::GuestAddressLiteral {
            offset,
            delta: cursor.read_i64()?,
        },
        RelocationKind::NamedThunkMove => {
            let hash = ThunkHash::from_bytes(cursor.read_exact_array::<THUNK_HASH_LEN>()?);
            Relocation::NamedThunkMove {
                offset,
                hash,
                register: cursor.read_u8()?,
            }
        }
        RelocationKind::GuestAddressMove => Relocation::GuestAddressMove {
            offset,
            delta: cursor.read_i64()?,
            register: cursor.read_u8()?,
        },
    })
}

pub fn split_cookie(bytes: &[u8], expected: FormatCookie) -> WireResult<&[u8]> {
    let mut cursor = Cursor::new(bytes);
    let found = FormatCookie::from_bytes(cursor.read_exact_array::<COOKIE_LEN>()?);
    if found != expected {
        return Err(WireError::CookieMismatch { expected, found });
    }
    Ok(&bytes[COOKIE_LEN..])
}

pub fn encode_index_header(config: &SerializationConfig) -> [u8; INDEX_HEADER_LEN] {
    let mut out = [0u8; INDEX_HEADER_LEN];
    out[..COOKIE_LEN].copy_from_slice(&FormatCookie::INDEX.to_bytes());
    out[COOKIE_LEN..].copy_from_slice(&config.to_bytes());
    out
}

pub fn split_index_header(bytes: &[u8]) -> WireResult<(SerializationConfig, &[u8])> {
    let rest = split_cookie(bytes, FormatCookie::INDEX)?;
    let mut cursor = Cursor::new(rest);
    let raw = cursor.read_exact_array::<SERIALIZATION_CONFIG_LEN>()?;
    let config =
        SerializationConfig::from_bytes(raw).ok_or(WireError::UnknownSerializationConfig)?;
    Ok((config, &rest[SERIALIZATION_CONFIG_LEN..]))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub guest_entry: u64,
    pub data_offset: u64,
    pub data_len: u64,
}

impl IndexEntry {
    pub fn tombstone(guest_entry: u64) -> Self {
        Self {
            guest_entry,
            data_offset: 0,
            data_len: 0,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.data_len == 0
    }

    pub fn to_bytes(self) -> [u8; INDEX_ENTRY_LEN] {
        let mut out = [0u8; INDEX_ENTRY_LEN];
        out[..8].copy_from_slice(&self.guest_entry.to_le_bytes());
        out[8..16].copy_from_slice(&self.data_offset.to_le_bytes());
        out[16..].copy_from_slice(&self.data_len.to_le_bytes());
        out
    }
}

pub fn decode_index_entries(bytes: &[u8]) -> WireResult<Vec<IndexEntry>> {
    if bytes.len() % INDEX_ENTRY_LEN != 0 {
        return Err(WireError::TruncatedIndex(bytes.len()));
    }
    let mut cursor = Cursor::new(bytes);
    let mut entries = Vec::with_capacity(bytes.len() / INDEX_ENTRY_LEN);
    while !cursor.is_eof() {
        entries.push(IndexEntry {
            guest_entry: cursor.read_u64()?,
            data_offset: cursor.read_u64()?,
            data_len: cursor.read_u64()?,
        });
    }
    Ok(entries)
}

pub fn describe_record(arch: HostArch, guest_entry: u64, record: &CacheRecord) -> String {
    let fragment = &record.fragment;
    let mut out = String::new();
    let _ = writeln!(&mut out, "entry {guest_entry:#x} ({arch})");
    let _ = writeln!(&mut out, "ranges ({}):", record.ranges.len());
    for (index, range) in record.ranges.iter().enumerate() {
        let _ = writeln!(
            &mut out,
            "  [{index:04}] {:#x}..{:#x} ({} bytes)",
            range.begin,
            range.end,
            range.len()
        );
    }

    let _ = writeln!(&mut out, "code ({} bytes):", fragment.code.len());
    for (line, chunk) in fragment.code.chunks(16).enumerate() {
        let start = line * 16;
        let end = start + chunk.len();
        let sites = fragment
            .relocations
            .iter()
            .enumerate()
            .filter(|(_, relocation)| {
                let offset = relocation.offset() as usize;
                offset >= start && offset < end
            })
            .map(|(index, _)| format!("#{index}"))
            .collect::<Vec<_>>();
        let encoded = format_hex_bytes(chunk);
        if sites.is_empty() {
            let _ = writeln!(&mut out, "{start:04x}\t{encoded}");
        } else {
            let _ = writeln!(
                &mut out,
                "{start:04x}\t{encoded:<47}\t; reloc {}",
                sites.join(" ")
            );
        }
    }

    let _ = writeln!(&mut out, "relocations ({}):", fragment.relocations.len());
    for (index, relocation) in fragment.relocations.iter().enumerate() {
        let kind = relocation.kind().name();
        let offset = relocation.offset();
        let detail = match relocation {
            Relocation::NamedSymbolLiteral { symbol, .. } => symbol.name().to_string(),
            Relocation::GuestAddressLiteral { delta, .. } => {
                format!(
                    "delta={} -> {:#x}",
                    signed_hex(*delta),
                    guest_address(guest_entry, *delta)
                )
            }
            Relocation::NamedThunkMove { hash, register, .. } => {
                format!("r{register} thunk={hash}")
            }
            Relocation::GuestAddressMove {
                delta, register, ..
            } => format!(
                "r{register} delta={} -> {:#x}",
                signed_hex(*delta),
                guest_address(guest_entry, *delta)
            ),
        };
        let _ = writeln!(
            &mut out,
            "  [{index:04}] +{offset:04x} w{} {kind} {detail}",
            relocation.patch_width(arch)
        );
    }
    out
}

pub(crate) fn write_u32_len(field: &'static str, len: usize, out: &mut Vec<u8>) -> WireResult<()> {
    let len_u32 = u32::try_from(len).map_err(|_| WireError::LengthTooLarge(field, len))?;
    out.extend_from_slice(&len_u32.to_le_bytes());
    Ok(())
}

pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub(crate) fn read_u8(&mut self) -> WireResult<u8> {
        let value = self
            .bytes
            .get(self.offset)
            .ok_or(WireError::UnexpectedEof)?;
        self.offset += 1;
        Ok(*value)
    }

    pub(crate) fn read_u32(&mut self) -> WireResult<u32> {
        Ok(u32::from_le_bytes(self.read_exact_array::<4>()?))
    }

    pub(crate) fn read_u64(&mut self) -> WireResult<u64> {
        Ok(u64::from_le_bytes(self.read_exact_array::<8>()?))
    }

    pub(crate) fn read_i64(&mut self) -> WireResult<i64> {
        Ok(i64::from_le_bytes(self.read_exact_array::<8>()?))
    }

    pub(crate) fn read_exact_array<const N: usize>(&mut self) -> WireResult<[u8; N]> {
        let bytes = self.read_exact(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub(crate) fn read_exact(&mut self, len: usize) -> WireResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or(WireError::UnexpectedEof)?;
        if end > self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    pub(crate) fn is_eof(&self) -> bool {
        self.offset == self.bytes.len()
    }
}

fn signed_hex(value: i64) -> String {
    if value < 0 {
        format!("-{:#x}", value.unsigned_abs())
    } else {
        format!("+{value:#x}")
    }
}

fn format_hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (idx, byte) in bytes.iter().enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        let _ = write!(&mut out, "{byte:02X}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> CacheRecord {
        CacheRecord::new(
            vec![GuestRange::new(0x400000, 0x400020)],
            CodeFragment::new(
                vec![0x90; 64],
                vec![
                    Relocation::GuestAddressMove {
                        offset: 4,
                        delta: 0x10,
                        register: 0,
                    },
                    Relocation::NamedSymbolLiteral {
                        offset: 20,
                        symbol: NamedSymbol::ExitFunctionLinker,
                    },
                    Relocation::NamedThunkMove {
                        offset: 28,
                        hash: ThunkHash::for_symbol("libc", "puts"),
                        register: 7,
                    },
                    Relocation::GuestAddressLiteral {
                        offset: 40,
                        delta: -8,
                    },
                ],
            ),
        )
    }

    #[test]
    fn relocation_payloads_match_abi_lengths() {
        for relocation in &sample_record().fragment.relocations {
            let mut out = Vec::new();
            encode_relocation(relocation, &mut out);
            let desc = cache_abi::relocation_kind_by_tag(out[0]).expect("tag should be known");
            assert_eq!(out.len(), 1 + desc.payload_len, "{}", desc.name);
        }
    }

    #[test]
    fn decode_rejects_unknown_kind_and_symbol() {
        let record = sample_record();
        let encoded = encode_record(&record).expect("record should encode");
        assert_eq!(decode_record(HostArch::X86_64, &encoded), Ok(record));

        // range count + one range + code length + code + relocation count
        let first_reloc = 4 + 16 + 4 + 64 + 4;
        let mut bad_kind = encoded.clone();
        bad_kind[first_reloc] = 0x7F;
        assert_eq!(
            decode_record(HostArch::X86_64, &bad_kind),
            Err(WireError::UnknownRelocationKind(0x7F))
        );

        // second relocation: tag + offset, then symbol id
        let symbol_at = first_reloc + 1 + 13 + 1 + 4;
        let mut bad_symbol = encoded;
        bad_symbol[symbol_at] = 9;
        assert_eq!(
            decode_record(HostArch::X86_64, &bad_symbol),
            Err(WireError::UnknownNamedSymbol(9))
        );
    }

    #[test]
    fn decode_rejects_truncation_and_trailing_bytes() {
        let encoded = encode_record(&sample_record()).expect("record should encode");
        for len in [0, 3, 20, encoded.len() - 1] {
            assert!(decode_record(HostArch::X86_64, &encoded[..len]).is_err());
        }
        let mut trailing = encoded;
        trailing.push(0);
        assert_eq!(
            decode_record(HostArch::X86_64, &trailing),
            Err(WireError::TrailingBytes)
        );
    }

    #[test]
    fn decode_validates_relocations_against_arch() {
        let encoded = encode_record(&sample_record()).expect("record should encode");
        // the x86-64 layout does not leave room for 16-byte aarch64 moves
        assert!(matches!(
            decode_record(HostArch::Aarch64, &encoded),
            Err(WireError::InvalidRelocation(_))
        ));
    }

    #[test]
    fn cookie_mismatch_is_reported() {
        let mut bytes = FormatCookie::DATA.to_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        assert_eq!(split_cookie(&bytes, FormatCookie::DATA), Ok(&[1u8, 2, 3][..]));
        assert!(matches!(
            split_cookie(&bytes, FormatCookie::INDEX),
            Err(WireError::CookieMismatch { .. })
        ));
        assert_eq!(
            split_cookie(&bytes[..5], FormatCookie::DATA),
            Err(WireError::UnexpectedEof)
        );
    }

    #[test]
    fn index_header_carries_serialization_config() {
        let config = SerializationConfig {
            max_inst_per_block: 64,
            paranoid_tso: true,
            ..SerializationConfig::default()
        };
        let mut bytes = encode_index_header(&config).to_vec();
        bytes.extend_from_slice(&IndexEntry::tombstone(0x1000).to_bytes());
        let (found, rest) = split_index_header(&bytes).expect("header decodes");
        assert_eq!(found, config);
        assert_eq!(rest.len(), INDEX_ENTRY_LEN);

        bytes[COOKIE_LEN + 5] = 0x01;
        assert_eq!(
            split_index_header(&bytes),
            Err(WireError::UnknownSerializationConfig)
        );
        assert_eq!(
            split_index_header(&bytes[..COOKIE_LEN + 3]),
            Err(WireError::UnexpectedEof)
        );
    }

    #[test]
    fn index_entries_are_fixed_width() {
        let entry = IndexEntry {
            guest_entry: 0x400000,
            data_offset: 8,
            data_len: 120,
        };
        let mut bytes = entry.to_bytes().to_vec();
        bytes.extend_from_slice(&IndexEntry::tombstone(0x400000).to_bytes());
        let entries = decode_index_entries(&bytes).expect("index should decode");
        assert_eq!(entries[0], entry);
        assert!(entries[1].is_tombstone());
        assert_eq!(
            decode_index_entries(&bytes[..30]),
            Err(WireError::TruncatedIndex(30))
        );
    }

    #[test]
    fn listing_annotates_relocation_sites() {
        let listing = describe_record(HostArch::X86_64, 0x400000, &sample_record());
        assert!(listing.contains("ranges (1):"));
        assert!(listing.contains("code (64 bytes):"));
        assert!(listing.contains("; reloc #0"));
        assert!(listing.contains("guest-address-move r0 delta=+0x10 -> 0x400010"));
        assert!(listing.contains("named-symbol-literal exit-function-linker"));
        assert!(listing.contains("delta=-0x8 -> 0x3ffff8"));
    }
}
