//! Host symbol table.
//!
//! The closed set of functions and variables a loaded image may import. Each
//! entry is contributed at link time by the `#[host_symbol]` attribute macro;
//! there is no runtime registration API and no fallback to the system
//! dynamic linker.

use linkme::distributed_slice;

/// Address of a host function as stored in [`HOST_SYMBOLS`].
#[derive(Clone, Copy, Debug)]
pub struct FnPtr(pub *const ());

impl FnPtr {
    pub fn addr(self) -> u64 {
        self.0 as u64
    }
}

// SAFETY: the wrapped pointers address code, which is never written.
unsafe impl Sync for FnPtr {}

/// `(import name, host address)` pairs, one per `#[host_symbol]` item.
#[distributed_slice]
pub static HOST_SYMBOLS: [(&str, FnPtr)] = [..];

/// Exact-name lookup. Names are matched byte for byte; Mach-O underscores
/// are stripped by the caller.
pub fn lookup(symbol_name: &str) -> Option<u64> {
    HOST_SYMBOLS
        .iter()
        .find(|(name, _)| *name == symbol_name)
        .map(|(_, ptr)| ptr.addr())
}

/// Every name in the table, in link order.
pub fn names() -> impl Iterator<Item = &'static str> {
    HOST_SYMBOLS.iter().map(|(name, _)| *name)
}

/// Resolve an import for a loaded image, reporting misses by name.
pub(crate) fn resolve(symbol_name: &str) -> crate::Result<u64> {
    match lookup(symbol_name) {
        Some(addr) => {
            tracing::trace!("Resolved {} to 0x{:x}", symbol_name, addr);
            Ok(addr)
        }
        None => {
            tracing::error!("symbol not found: {}", symbol_name);
            Err(crate::Error::SymbolNotFound(symbol_name.to_string()))
        }
    }
}
