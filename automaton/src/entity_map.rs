//! Insertion-ordered entity maps with split keys/values snapshot streams.
//!
//! Snapshots write keys in insertion order into the "keys" stream and entity
//! fields into the "values" stream, so that loading keys first recreates the
//! map shape before values are filled in.

use crate::{MalformedSnafu, WireReader, WireResult, WireWriter};
use data_types::{ObjectId, Timestamp, TransactionId};
use std::collections::HashMap;
use std::hash::Hash;

/// A value with a canonical wire encoding.
pub trait Persist: Sized {
    /// Append the encoding of `self`.
    fn save(&self, writer: &mut WireWriter);

    /// Decode one value.
    fn load(reader: &mut WireReader<'_>) -> WireResult<Self>;
}

impl Persist for u64 {
    fn save(&self, writer: &mut WireWriter) {
        writer.write_u64(*self);
    }

    fn load(reader: &mut WireReader<'_>) -> WireResult<Self> {
        reader.read_u64()
    }
}

impl Persist for i64 {
    fn save(&self, writer: &mut WireWriter) {
        writer.write_i64(*self);
    }

    fn load(reader: &mut WireReader<'_>) -> WireResult<Self> {
        reader.read_i64()
    }
}

impl Persist for bool {
    fn save(&self, writer: &mut WireWriter) {
        writer.write_bool(*self);
    }

    fn load(reader: &mut WireReader<'_>) -> WireResult<Self> {
        reader.read_bool()
    }
}

impl Persist for String {
    fn save(&self, writer: &mut WireWriter) {
        writer.write_string(self);
    }

    fn load(reader: &mut WireReader<'_>) -> WireResult<Self> {
        reader.read_string()
    }
}

impl Persist for ObjectId {
    fn save(&self, writer: &mut WireWriter) {
        writer.write_u128(self.as_u128());
    }

    fn load(reader: &mut WireReader<'_>) -> WireResult<Self> {
        let raw = reader.read_u128()?;
        Self::from_u128(raw).map_err(|e| {
            MalformedSnafu {
                message: e.to_string(),
            }
            .build()
        })
    }
}

impl Persist for TransactionId {
    fn save(&self, writer: &mut WireWriter) {
        self.get().save(writer);
    }

    fn load(reader: &mut WireReader<'_>) -> WireResult<Self> {
        let id = ObjectId::load(reader)?;
        Self::try_from_object(id).map_err(|e| {
            MalformedSnafu {
                message: e.to_string(),
            }
            .build()
        })
    }
}

impl Persist for Timestamp {
    fn save(&self, writer: &mut WireWriter) {
        writer.write_u64(self.0);
    }

    fn load(reader: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self(reader.read_u64()?))
    }
}

impl<T: Persist> Persist for Option<T> {
    fn save(&self, writer: &mut WireWriter) {
        match self {
            Some(value) => {
                writer.write_bool(true);
                value.save(writer);
            }
            None => writer.write_bool(false),
        }
    }

    fn load(reader: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(if reader.read_bool()? {
            Some(T::load(reader)?)
        } else {
            None
        })
    }
}

impl<T: Persist> Persist for Vec<T> {
    fn save(&self, writer: &mut WireWriter) {
        writer.write_u32(self.len() as u32);
        for value in self {
            value.save(writer);
        }
    }

    fn load(reader: &mut WireReader<'_>) -> WireResult<Self> {
        let count = reader.read_u32()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(T::load(reader)?);
        }
        Ok(values)
    }
}

/// A map of entities keyed by id, preserving insertion order.
#[derive(Debug)]
pub struct EntityMap<K, V> {
    order: Vec<K>,
    entities: HashMap<K, V>,
}

impl<K, V> Default for EntityMap<K, V> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            entities: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash, V> EntityMap<K, V> {
    /// Create an empty map.
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Insert an entity, returning the previous one under the same key.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.entities.insert(key, value);
        if previous.is_none() {
            self.order.push(key);
        }
        previous
    }

    /// Remove an entity.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entities.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    /// Borrow an entity.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entities.get(key)
    }

    /// Mutably borrow an entity.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entities.get_mut(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entities.contains_key(key)
    }

    /// Iterate entities in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.order.iter().map(|k| (*k, &self.entities[k]))
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.order.iter().copied()
    }

    /// Drop all entities.
    pub fn clear(&mut self) {
        self.order.clear();
        self.entities.clear();
    }
}

impl<K: Copy + Eq + Hash + Persist, V> EntityMap<K, V> {
    /// Write the keys stream.
    pub fn save_keys(&self, writer: &mut WireWriter) {
        writer.write_u32(self.order.len() as u32);
        for key in &self.order {
            key.save(writer);
        }
    }

    /// Read the keys stream, recreating entries with default values.
    pub fn load_keys(&mut self, reader: &mut WireReader<'_>) -> WireResult<()>
    where
        V: Default,
    {
        self.clear();
        let count = reader.read_u32()?;
        for _ in 0..count {
            let key = K::load(reader)?;
            self.insert(key, V::default());
        }
        Ok(())
    }
}

impl<K: Copy + Eq + Hash, V: Persist> EntityMap<K, V> {
    /// Write the values stream, aligned with the keys stream.
    pub fn save_values(&self, writer: &mut WireWriter) {
        for key in &self.order {
            self.entities[key].save(writer);
        }
    }

    /// Read the values stream into entries created by
    /// [`EntityMap::load_keys`].
    pub fn load_values(&mut self, reader: &mut WireReader<'_>) -> WireResult<()> {
        for key in &self.order {
            let value = V::load(reader)?;
            *self.entities.get_mut(key).expect("keys loaded first") = value;
        }
        Ok(())
    }
}
