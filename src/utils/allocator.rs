use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::marker::PhantomData;

/// Unique identifier with generation tracking to prevent stale references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ArenaId {
    pub index: u32,
    pub generation: u32,
}

impl ArenaId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// Typed key over an [`ArenaId`], so camera ids cannot index the light arena.
pub trait ArenaKey: Copy + Eq + std::hash::Hash + std::fmt::Debug {
    fn from_raw(id: ArenaId) -> Self;
    fn raw(self) -> ArenaId;

    fn index(self) -> usize {
        self.raw().index as usize
    }
}

/// Declares a newtype key usable with [`Arena`].
#[macro_export]
macro_rules! arena_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name(pub $crate::utils::allocator::ArenaId);

        impl $crate::utils::allocator::ArenaKey for $name {
            fn from_raw(id: $crate::utils::allocator::ArenaId) -> Self {
                Self(id)
            }

            fn raw(self) -> $crate::utils::allocator::ArenaId {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}#{}v{}", stringify!($name), self.0.index, self.0.generation)
            }
        }
    };
}

/// Generational arena that hands out stable IDs while preventing use-after-free.
///
/// Removed slots go on a free list and are reused with a bumped generation, so ids
/// stay small and an old id never resolves to the new occupant.
pub struct Arena<K, T> {
    items: Vec<Option<T>>,
    generations: Vec<u32>,
    free_list: VecDeque<u32>,
    _key: PhantomData<K>,
}

impl<K: ArenaKey, T> Default for Arena<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ArenaKey, T> Arena<K, T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            generations: Vec::new(),
            free_list: VecDeque::new(),
            _key: PhantomData,
        }
    }

    pub fn insert(&mut self, item: T) -> K {
        self.insert_with(|_| item)
    }

    /// Inserts a value built from its own future id.
    pub fn insert_with(&mut self, build: impl FnOnce(K) -> T) -> K {
        if let Some(index) = self.free_list.pop_front() {
            let generation = self.generations[index as usize];
            let key = K::from_raw(ArenaId::new(index, generation));
            self.items[index as usize] = Some(build(key));
            return key;
        }

        let index = self.items.len() as u32;
        let key = K::from_raw(ArenaId::new(index, 0));
        self.items.push(Some(build(key)));
        self.generations.push(0);
        key
    }

    pub fn get(&self, id: K) -> Option<&T> {
        if self.is_valid(id) {
            self.items.get(id.index()).and_then(|slot| slot.as_ref())
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, id: K) -> Option<&mut T> {
        if self.is_valid(id) {
            self.items.get_mut(id.index()).and_then(|slot| slot.as_mut())
        } else {
            None
        }
    }

    pub fn contains(&self, id: K) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: K) -> Option<T> {
        if !self.is_valid(id) {
            return None;
        }
        let slot = self.items.get_mut(id.index())?;
        if slot.is_some() {
            self.generations[id.index()] = self.generations[id.index()].wrapping_add(1);
            self.free_list.push_back(id.raw().index);
        }
        slot.take()
    }

    /// Occupied entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> + '_ {
        self.items.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_ref().map(|item| {
                (
                    K::from_raw(ArenaId::new(index as u32, self.generations[index])),
                    item,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> + '_ {
        let generations = &self.generations;
        self.items
            .iter_mut()
            .enumerate()
            .filter_map(move |(index, slot)| {
                slot.as_mut().map(|item| {
                    (
                        K::from_raw(ArenaId::new(index as u32, generations[index])),
                        item,
                    )
                })
            })
    }

    pub fn ids(&self) -> Vec<K> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn len(&self) -> usize {
        self.items.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry and returns them, leaving all ids stale.
    pub fn drain(&mut self) -> Vec<(K, T)> {
        let ids = self.ids();
        ids.into_iter()
            .filter_map(|id| self.remove(id).map(|item| (id, item)))
            .collect()
    }

    fn is_valid(&self, id: K) -> bool {
        self.generations
            .get(id.index())
            .copied()
            .map(|gen| gen == id.raw().generation)
            .unwrap_or(false)
    }
}
