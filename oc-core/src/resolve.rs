use std::collections::HashMap;

use cache_abi::NAMED_SYMBOL_COUNT;
use parking_lot::RwLock;

use crate::reloc::{NamedSymbol, Relocation, ThunkHash, guest_address};

pub trait ThunkResolver {
    fn lookup(&self, hash: &ThunkHash) -> Option<u64>;
}

impl ThunkResolver for HashMap<ThunkHash, u64> {
    fn lookup(&self, hash: &ThunkHash) -> Option<u64> {
        self.get(hash).copied()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoThunks;

impl ThunkResolver for NoThunks {
    fn lookup(&self, _hash: &ThunkHash) -> Option<u64> {
        None
    }
}

#[derive(Debug, Default)]
pub struct ThunkTable {
    entries: RwLock<HashMap<ThunkHash, u64>>,
}

impl ThunkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hash: ThunkHash, address: u64) -> Option<u64> {
        self.entries.write().insert(hash, address)
    }

    pub fn unregister(&self, hash: &ThunkHash) -> Option<u64> {
        self.entries.write().remove(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ThunkResolver for ThunkTable {
    fn lookup(&self, hash: &ThunkHash) -> Option<u64> {
        self.entries.read().get(hash).copied()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamedSymbolTable {
    addresses: [u64; NAMED_SYMBOL_COUNT],
}

impl NamedSymbolTable {
    pub fn new(addresses: [u64; NAMED_SYMBOL_COUNT]) -> Self {
        Self { addresses }
    }

    pub fn from_fn(mut f: impl FnMut(NamedSymbol) -> u64) -> Self {
        let mut addresses = [0u64; NAMED_SYMBOL_COUNT];
        for symbol in NamedSymbol::ALL {
            addresses[symbol.id() as usize] = f(symbol);
        }
        Self { addresses }
    }

    pub fn with(mut self, symbol: NamedSymbol, address: u64) -> Self {
        self.addresses[symbol.id() as usize] = address;
        self
    }

    pub fn lookup(&self, symbol: NamedSymbol) -> u64 {
        self.addresses[symbol.id() as usize]
    }
}

#[derive(Clone, Copy)]
pub struct ResolutionContext<'a> {
    pub guest_entry: u64,
    pub symbols: &'a NamedSymbolTable,
    pub thunks: &'a dyn ThunkResolver,
}

impl<'a> ResolutionContext<'a> {
    pub fn new(
        guest_entry: u64,
        symbols: &'a NamedSymbolTable,
        thunks: &'a dyn ThunkResolver,
    ) -> Self {
        Self {
            guest_entry,
            symbols,
            thunks,
        }
    }

    pub fn resolve(&self, relocation: &Relocation) -> Result<u64, ThunkHash> {
        match relocation {
            Relocation::NamedSymbolLiteral { symbol, .. } => Ok(self.symbols.lookup(*symbol)),
            Relocation::GuestAddressLiteral { delta, .. }
            | Relocation::GuestAddressMove { delta, .. } => {
                Ok(guest_address(self.guest_entry, *delta))
            }
            Relocation::NamedThunkMove { hash, .. } => self.thunks.lookup(hash).ok_or(*hash),
        }
    }
}

impl std::fmt::Debug for ResolutionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionContext")
            .field("guest_entry", &format_args!("{:#x}", self.guest_entry))
            .field("symbols", self.symbols)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_table_is_total() {
        let table = NamedSymbolTable::from_fn(|symbol| 0x1000 + u64::from(symbol.id()));
        for symbol in NamedSymbol::ALL {
            assert_eq!(table.lookup(symbol), 0x1000 + u64::from(symbol.id()));
        }
        let table = table.with(NamedSymbol::ExitFunctionLinker, 0xAAAA_0000);
        assert_eq!(table.lookup(NamedSymbol::ExitFunctionLinker), 0xAAAA_0000);
    }

    #[test]
    fn context_resolves_each_kind() {
        let symbols = NamedSymbolTable::from_fn(|_| 0xAAAA_0000);
        let hash = ThunkHash::for_symbol("libX11", "XOpenDisplay");
        let thunks = ThunkTable::new();
        thunks.register(hash, 0xBEEF);
        let ctx = ResolutionContext::new(0x400000, &symbols, &thunks);

        assert_eq!(
            ctx.resolve(&Relocation::GuestAddressMove {
                offset: 0,
                delta: -0x10,
                register: 0
            }),
            Ok(0x3FFFF0)
        );
        assert_eq!(
            ctx.resolve(&Relocation::NamedThunkMove {
                offset: 0,
                hash,
                register: 0
            }),
            Ok(0xBEEF)
        );

        thunks.unregister(&hash);
        assert_eq!(
            ctx.resolve(&Relocation::NamedThunkMove {
                offset: 0,
                hash,
                register: 0
            }),
            Err(hash)
        );
    }
}
