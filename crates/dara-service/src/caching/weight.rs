use std::collections::{BTreeMap, HashMap};
use std::mem::size_of;
use std::sync::Arc;

use bytes::Bytes;

/// The approximate number of bytes a value occupies while it is cached.
///
/// This only feeds the size metric of the [`CacheStore`](super::CacheStore). It counts the heap
/// payload of the value but neither the key nor any hash-table overhead, so it must never be
/// treated as exact.
pub trait CacheWeight {
    fn weight(&self) -> usize;
}

macro_rules! impl_fixed_weight {
    ($($ty:ty),* $(,)?) => {
        $(
            impl CacheWeight for $ty {
                fn weight(&self) -> usize {
                    size_of::<$ty>()
                }
            }
        )*
    };
}

impl_fixed_weight!(bool, i32, i64, u32, u64, usize, f32, f64, ());

impl CacheWeight for String {
    fn weight(&self) -> usize {
        size_of::<String>() + self.len()
    }
}

impl CacheWeight for Bytes {
    fn weight(&self) -> usize {
        size_of::<Bytes>() + self.len()
    }
}

impl<T: CacheWeight> CacheWeight for Vec<T> {
    fn weight(&self) -> usize {
        size_of::<Vec<T>>() + self.iter().map(CacheWeight::weight).sum::<usize>()
    }
}

impl<T: CacheWeight> CacheWeight for Option<T> {
    fn weight(&self) -> usize {
        self.as_ref().map_or(size_of::<Option<T>>(), CacheWeight::weight)
    }
}

impl<T: CacheWeight + ?Sized> CacheWeight for Arc<T> {
    fn weight(&self) -> usize {
        (**self).weight()
    }
}

impl<K: CacheWeight, V: CacheWeight> CacheWeight for BTreeMap<K, V> {
    fn weight(&self) -> usize {
        size_of::<BTreeMap<K, V>>()
            + self
                .iter()
                .map(|(k, v)| k.weight() + v.weight())
                .sum::<usize>()
    }
}

impl<K: CacheWeight, V: CacheWeight, S> CacheWeight for HashMap<K, V, S> {
    fn weight(&self) -> usize {
        size_of::<HashMap<K, V, S>>()
            + self
                .iter()
                .map(|(k, v)| k.weight() + v.weight())
                .sum::<usize>()
    }
}

impl CacheWeight for serde_json::Value {
    fn weight(&self) -> usize {
        use serde_json::Value;

        size_of::<Value>()
            + match self {
                Value::Null | Value::Bool(_) | Value::Number(_) => 0,
                Value::String(s) => s.len(),
                Value::Array(items) => items.iter().map(CacheWeight::weight).sum(),
                Value::Object(map) => map.iter().map(|(k, v)| k.len() + v.weight()).sum(),
            }
    }
}
