//! A garbage collector (GC) that pretends to have a `'static` lifetime.
//!
//! For the compiler's purposes the GC is an interner: identifiers, string
//! literals, and function names are deduplicated here, and everything stays
//! alive until the GC is uninstalled. Nothing is ever collected while a
//! compilation holds on to the [ActiveGC] token.

use std::collections::HashSet;
use std::ptr::addr_of_mut;

/// A big store of all dynamic string data in the application. Interned strings
/// are kept forever, until the GC itself is dropped.
#[derive(Clone, Debug, Default)]
pub struct GC {
    strings: HashSet<String>,
}

/// A token that proves the global static [GC] has been installed. The only way
/// to obtain this token is to install the GC (see [ActiveGC::install]). When
/// the token is dropped, the global static GC is uninstalled and dropped.
///
/// ```
/// use rox::gc::ActiveGC;
/// let gc = ActiveGC::install();
///
/// // Interning the same text twice yields the same storage:
/// let a = ActiveGC::intern("hello");
/// let b = ActiveGC::intern("hello");
/// assert_eq!(a.as_ptr(), b.as_ptr());
/// assert_eq!(1, ActiveGC::n_strings());
/// // When `gc` goes out of scope, the GC is automatically uninstalled.
/// ```
#[derive(Debug)]
pub struct ActiveGC(());

/// The actual static (global) [GC] instance. Install with `into_active_gc()`.
static mut ACTIVE_GC: Option<GC> = None;

impl GC {
    /// Adds `text` to storage, deduplicating against previously stored
    /// strings. Returns a reference to the stored copy.
    fn intern(&mut self, text: &str) -> &str {
        if !self.strings.contains(text) {
            self.strings.insert(text.to_owned());
        }
        self.strings.get(text).expect("just inserted this string")
    }

    /// Consume self and convert it into the [ActiveGC].
    #[must_use]
    pub fn into_active_gc(self) -> ActiveGC {
        unsafe {
            *addr_of_mut!(ACTIVE_GC) = Some(self);
        }
        ActiveGC(())
    }

    /// Return how many strings are currently stored.
    fn n_strings(&self) -> usize {
        self.strings.len()
    }
}

impl ActiveGC {
    /// Create a [GC] and install it as the active GC.
    ///
    /// # Panics
    ///
    /// Only one [GC] instance can be active at a time. The process panics
    /// **non-deterministically** if you try to install a [GC] while one is
    /// already installed.
    #[must_use]
    pub fn install() -> ActiveGC {
        GC::default().into_active_gc()
    }

    /// Intern a string in the active [GC] and return the stored copy.
    ///
    /// # Warning
    ///
    /// The reference does not actually have `'static` lifetime: it lives for
    /// as long as the [ActiveGC] is installed. Dropping the token while such
    /// references are live is a use-after-free waiting to happen, which is why
    /// compilation borrows the token for its whole duration.
    pub fn intern(text: &str) -> &'static str {
        Self::get().intern(text)
    }

    /// Return how many strings are currently stored.
    pub fn n_strings() -> usize {
        Self::get().n_strings()
    }

    /// Get the current active [GC].
    fn get() -> &'static mut GC {
        unsafe { (*addr_of_mut!(ACTIVE_GC)).as_mut() }
            .expect("Tried to get active GC, but it's not installed")
    }
}

impl Drop for ActiveGC {
    fn drop(&mut self) {
        // Uninstall the GC by taking ownership of it.
        unsafe { (*addr_of_mut!(ACTIVE_GC)).take() }
            .expect("Trying to drop active GC, but it's not installed");
        // GC dropped here!
    }
}

#[cfg(test)]
mod test {
    // Since the active GC is SHARED, MUTABLE STATE 👹, these tests **must**
    // run in serial, or else they will trample over each others' GC :/
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn interning_deduplicates() {
        let mut gc = GC::default();
        let first = gc.intern("beep").as_ptr();
        let second = gc.intern("beep").as_ptr();
        assert_eq!(first, second);
        assert_eq!(1, gc.n_strings());

        gc.intern("boop");
        assert_eq!(2, gc.n_strings());
    }

    #[test]
    #[serial]
    fn install_and_use() {
        let gc = GC::default();
        let _active_gc = gc.into_active_gc();

        let s = ActiveGC::intern("🦀");
        assert_eq!("🦀", s);
        assert_eq!(1, ActiveGC::n_strings());
    }

    #[test]
    #[serial]
    #[should_panic(expected = "Tried to get active GC")]
    fn using_active_gc_when_not_installed() {
        ActiveGC::intern("🎷");
    }

    #[test]
    #[serial]
    #[should_panic(expected = "Tried to get active GC")]
    fn using_active_gc_after_drop() {
        {
            let _active_gc = ActiveGC::install();
            assert_eq!(0, ActiveGC::n_strings());
        }

        ActiveGC::intern("🍕");
    }
}
