use super::{ShardKey, ShardMap};

use serde::de::{Deserialize, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserializer;

use std::fmt;
use std::marker::PhantomData;

pub struct ShardMapVisitor<K: ShardKey, V> {
    marker: PhantomData<fn() -> ShardMap<K, V>>,
}

impl<K, V> ShardMapVisitor<K, V>
where
    K: ShardKey,
{
    fn new() -> Self {
        ShardMapVisitor {
            marker: PhantomData,
        }
    }
}

impl<'de, K, V> Visitor<'de> for ShardMapVisitor<K, V>
where
    K: Deserialize<'de> + ShardKey,
    V: Deserialize<'de>,
{
    type Value = ShardMap<K, V>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a ShardMap")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let map = ShardMap::new();

        while let Some((key, value)) = access.next_entry()? {
            map.upsert(key, value);
        }

        Ok(map)
    }
}

impl<'de, K, V> Deserialize<'de> for ShardMap<K, V>
where
    K: Deserialize<'de> + ShardKey,
    V: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(ShardMapVisitor::<K, V>::new())
    }
}

impl<K, V> Serialize for ShardMap<K, V>
where
    K: Serialize + ShardKey,
    V: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        let mut error = None;
        self.scan(|k, v| {
            if error.is_none() {
                if let Err(e) = map.serialize_entry(k, v) {
                    error.replace(e);
                }
            }
        });

        if let Some(e) = error {
            return Err(e);
        }

        map.end()
    }
}
