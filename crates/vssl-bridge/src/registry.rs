//! Generation-checked handle arena.
//!
//! The native engine never holds a Rust reference. It stores a [`Token`] in its
//! per-session user-data slot and hands it back on every hook invocation; this
//! registry is the only place a token turns back into an object.
//!
//! A token packs a slot index into the low half of a `usize` and the slot's
//! generation into the high half. Releasing a slot bumps its generation, so
//! stale tokens miss on lookup. A slot whose generation would wrap is retired
//! instead of reused, which keeps a released token unresolvable for the life
//! of the process.

use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::RegistryError;

const HALF_BITS: u32 = usize::BITS / 2;
const INDEX_MASK: usize = (1usize << HALF_BITS) - 1;
const MAX_INDEX: usize = INDEX_MASK;
const MAX_GENERATION: usize = INDEX_MASK;

/// Opaque, native-visible identifier for a registered object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(NonZeroUsize);

impl Token {
    fn pack(index: usize, generation: usize) -> Option<Self> {
        NonZeroUsize::new((generation << HALF_BITS) | (index & INDEX_MASK)).map(Token)
    }

    pub fn index(self) -> usize {
        self.0.get() & INDEX_MASK
    }

    pub fn generation(self) -> usize {
        self.0.get() >> HALF_BITS
    }

    /// Encode the token as the pointer-sized value stored in native memory.
    pub fn into_raw(self) -> *mut c_void {
        self.0.get() as *mut c_void
    }

    /// Decode a value previously produced by [`Token::into_raw`]. Null yields `None`.
    pub fn from_raw(raw: *mut c_void) -> Option<Self> {
        NonZeroUsize::new(raw as usize).map(Token)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}v{})", self.index(), self.generation())
    }
}

struct Slot<T> {
    generation: usize,
    value: Option<Arc<T>>,
}

struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    live: usize,
}

pub struct HandleRegistry<T> {
    label: &'static str,
    arena: RwLock<Arena<T>>,
}

impl<T> HandleRegistry<T> {
    pub const fn new(label: &'static str) -> Self {
        Self {
            label,
            arena: parking_lot::const_rwlock(Arena {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Bind `value` to a fresh token.
    pub fn register(&self, value: Arc<T>) -> Result<Token, RegistryError> {
        let exhausted = RegistryError::Exhausted { label: self.label };
        let mut arena = self.arena.write();
        let index = match arena.free.pop() {
            Some(index) => index,
            None => {
                let index = arena.slots.len();
                if index > MAX_INDEX {
                    return Err(exhausted);
                }
                arena.slots.push(Slot {
                    generation: 1,
                    value: None,
                });
                index
            }
        };
        let slot = &mut arena.slots[index];
        let token = Token::pack(index, slot.generation).ok_or(exhausted)?;
        slot.value = Some(value);
        arena.live += 1;
        tracing::trace!(target: "vssl::registry", registry = self.label, ?token, "registered");
        Ok(token)
    }

    /// Look up the object bound to `token`.
    pub fn resolve(&self, token: Token) -> Result<Arc<T>, RegistryError> {
        let arena = self.arena.read();
        arena
            .slots
            .get(token.index())
            .filter(|slot| slot.generation == token.generation())
            .and_then(|slot| slot.value.clone())
            .ok_or(RegistryError::NotFound(token))
    }

    /// Release `token`. Returns the object it was bound to, or `None` if the
    /// token was already released or never issued.
    pub fn unregister(&self, token: Token) -> Option<Arc<T>> {
        let mut arena = self.arena.write();
        let index = token.index();
        let slot = arena.slots.get_mut(index)?;
        if slot.generation != token.generation() {
            return None;
        }
        let value = slot.value.take()?;
        let retired = slot.generation >= MAX_GENERATION;
        if !retired {
            slot.generation += 1;
            arena.free.push(index);
        }
        arena.live -= 1;
        tracing::trace!(target: "vssl::registry", registry = self.label, ?token, retired, "unregistered");
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.arena.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> fmt::Debug for HandleRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arena = self.arena.read();
        f.debug_struct("HandleRegistry")
            .field("label", &self.label)
            .field("live", &arena.live)
            .field("slots", &arena.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::thread;

    #[test]
    fn resolves_exact_identity() {
        let registry = HandleRegistry::new("test");
        let value = Arc::new(String::from("session"));
        let token = registry.register(Arc::clone(&value)).expect("register");

        let first = registry.resolve(token).expect("first resolve");
        let second = registry.resolve(token).expect("second resolve");
        assert!(Arc::ptr_eq(&first, &value));
        assert!(Arc::ptr_eq(&second, &value));
    }

    #[test]
    fn released_token_never_resolves_even_after_slot_reuse() {
        let registry = HandleRegistry::new("test");
        let stale = registry.register(Arc::new(1u32)).expect("register");
        assert!(registry.unregister(stale).is_some());
        assert_eq!(registry.resolve(stale), Err(RegistryError::NotFound(stale)));

        let fresh = registry.register(Arc::new(2u32)).expect("register");
        assert_eq!(fresh.index(), stale.index());
        assert_ne!(fresh, stale);
        assert_eq!(registry.resolve(stale), Err(RegistryError::NotFound(stale)));
        assert_eq!(*registry.resolve(fresh).expect("fresh"), 2);
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = HandleRegistry::new("test");
        let token = registry.register(Arc::new(())).expect("register");
        assert!(registry.unregister(token).is_some());
        assert!(registry.unregister(token).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn raw_round_trip_preserves_token() {
        let registry = HandleRegistry::new("test");
        let token = registry.register(Arc::new(())).expect("register");
        assert!(!token.into_raw().is_null());
        assert_eq!(Token::from_raw(token.into_raw()), Some(token));
        assert_eq!(Token::from_raw(std::ptr::null_mut()), None);
    }

    #[test]
    fn slot_is_retired_when_generation_saturates() {
        let registry = HandleRegistry::new("test");
        let token = registry.register(Arc::new(0u8)).expect("register");
        registry.arena.write().slots[token.index()].generation = MAX_GENERATION;
        let saturated = Token::pack(token.index(), MAX_GENERATION).expect("pack");
        registry.arena.write().slots[token.index()].value = Some(Arc::new(1u8));

        assert!(registry.unregister(saturated).is_some());
        let next = registry.register(Arc::new(2u8)).expect("register");
        assert_ne!(next.index(), saturated.index());
        assert!(registry.resolve(saturated).is_err());
    }

    #[test]
    fn concurrent_sessions_register_and_release_independently() {
        let registry = Arc::new(HandleRegistry::<usize>::new("test"));
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for round in 0..500 {
                        let value = worker * 10_000 + round;
                        let token = registry.register(Arc::new(value)).expect("register");
                        assert_eq!(*registry.resolve(token).expect("resolve"), value);
                        assert!(registry.unregister(token).is_some());
                        assert!(registry.resolve(token).is_err());
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }
        assert!(registry.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register,
        Unregister(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Register),
            2 => any::<usize>().prop_map(Op::Unregister),
        ]
    }

    proptest! {
        #[test]
        fn live_tokens_are_unique_and_released_tokens_stay_dead(ops in prop::collection::vec(op_strategy(), 1..200)) {
            let registry = HandleRegistry::new("prop");
            let mut live: HashMap<Token, u64> = HashMap::new();
            let mut released: Vec<Token> = Vec::new();
            let mut next = 0u64;

            for op in ops {
                match op {
                    Op::Register => {
                        let token = registry.register(Arc::new(next)).expect("register");
                        prop_assert!(!live.contains_key(&token));
                        prop_assert!(!released.contains(&token));
                        live.insert(token, next);
                        next += 1;
                    }
                    Op::Unregister(pick) => {
                        if live.is_empty() {
                            continue;
                        }
                        let mut tokens: Vec<Token> = live.keys().copied().collect();
                        tokens.sort_by_key(|t| t.into_raw() as usize);
                        let token = tokens[pick % tokens.len()];
                        live.remove(&token);
                        prop_assert!(registry.unregister(token).is_some());
                        released.push(token);
                    }
                }

                for (token, value) in &live {
                    prop_assert_eq!(*registry.resolve(*token).expect("live"), *value);
                }
                for token in &released {
                    prop_assert!(registry.resolve(*token).is_err());
                }
                prop_assert_eq!(registry.len(), live.len());
            }
        }
    }
}
