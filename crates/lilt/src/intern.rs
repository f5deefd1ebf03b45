//! Symbol interning and gensym.
//!
//! Symbols are reference-counted strings registered in a thread-local
//! obarray, so two reads of the same name yield pointer-identical symbols
//! and `eq`-style comparison is a pointer check in the common case.
//! `gensym` mints fresh names from a process-wide counter; the generated
//! names start with a space so the reader can never collide with them.

use std::{
    cell::RefCell,
    fmt,
    hash::{Hash, Hasher},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering::Relaxed},
};

use ahash::AHashMap;

/// An interned Scheme symbol.
///
/// Cheap to clone; equality is pointer identity with a content-comparison
/// fallback, matching `eq?` on interned symbols.
#[derive(Debug, Clone)]
pub struct Symbol(Rc<str>);

thread_local! {
    static OBARRAY: RefCell<AHashMap<Rc<str>, Symbol>> = RefCell::new(AHashMap::new());
}

/// Monotonic counter feeding `gensym`. Atomic so fresh names stay unique
/// even if several interpreter threads mint them concurrently.
static GENSYM_SERIAL: AtomicU64 = AtomicU64::new(0);

impl Symbol {
    /// Returns the interned symbol for `name`, creating it on first use.
    pub fn intern(name: &str) -> Self {
        OBARRAY.with(|obarray| {
            let mut obarray = obarray.borrow_mut();
            if let Some(sym) = obarray.get(name) {
                return sym.clone();
            }
            let storage: Rc<str> = Rc::from(name);
            let sym = Self(Rc::clone(&storage));
            obarray.insert(storage, sym.clone());
            sym
        })
    }

    /// The symbol's name.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Returns a fresh symbol whose name no other symbol shares.
///
/// The name is `" {prefix}{serial}"`; the leading space keeps it out of the
/// reader's reach.
pub fn gensym(prefix: &str) -> Symbol {
    let serial = GENSYM_SERIAL.fetch_add(1, Relaxed);
    Symbol::intern(&format!(" {prefix}{serial}"))
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_pointer_identical() {
        let a = Symbol::intern("lambda");
        let b = Symbol::intern("lambda");
        assert!(Rc::ptr_eq(&a.0, &b.0));
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_names_are_distinct_symbols() {
        assert_ne!(Symbol::intern("car"), Symbol::intern("cdr"));
    }

    #[test]
    fn gensyms_are_fresh() {
        let a = gensym("cond");
        let b = gensym("cond");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(' '));
    }

    #[test]
    fn gensym_does_not_collide_with_interned_names() {
        let g = gensym("or");
        assert_ne!(g, Symbol::intern("or"));
    }
}
