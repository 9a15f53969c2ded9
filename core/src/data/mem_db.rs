use crate::data::Database;
use std::{
	collections::HashMap,
	sync::{Arc, PoisonError, RwLock},
};
use tracing::error;

use super::RecordKey;

#[derive(Clone)]
pub struct MemoryDB {
	map: Arc<RwLock<HashMap<HashMapKey, String>>>,
}

#[derive(Eq, Hash, PartialEq)]
pub struct HashMapKey(pub String);

impl Default for MemoryDB {
	fn default() -> Self {
		MemoryDB {
			map: Arc::new(RwLock::new(HashMap::new())),
		}
	}
}

impl<T: RecordKey> From<T> for HashMapKey {
	fn from(value: T) -> Self {
		let key = value.key();
		HashMapKey(match value.space() {
			Some(space) => format!("{space}::{key}"),
			None => key,
		})
	}
}

impl Database for MemoryDB {
	fn put<T: RecordKey>(&self, key: T, value: T::Type) {
		let value = match serde_json::to_string(&value) {
			Ok(value) => value,
			Err(error) => {
				error!(%error, key = key.key(), "Encoding data for MemoryDB failed");
				return;
			},
		};
		let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
		map.insert(key.into(), value);
	}

	fn get<T: RecordKey>(&self, key: T) -> Option<T::Type> {
		let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
		let value = map.get(&key.into())?;
		serde_json::from_str(value)
			.map_err(|error| error!(%error, "Decoding data from MemoryDB failed"))
			.ok()
	}

	fn delete<T: RecordKey>(&self, key: T) {
		let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
		map.remove(&key.into());
	}
}
