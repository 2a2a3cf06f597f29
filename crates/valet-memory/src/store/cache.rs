use tracing::warn;

use crate::error::Result;
use crate::types::now_ms;

use super::Store;

impl Store {
    /// Read a cached retrieval result. Expired entries and read failures
    /// both come back as `None`; a broken cache never blocks recall.
    pub fn cache_get(&self, cache_key: &str) -> Option<String> {
        let conn = self.conn.lock().unwrap();
        let result: std::result::Result<(String, i64), rusqlite::Error> = conn.query_row(
            "SELECT result_json, expires_at FROM retrieval_cache WHERE cache_key = ?1",
            rusqlite::params![cache_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        );
        match result {
            Ok((json, expires_at)) if expires_at > now_ms() => Some(json),
            Ok(_) => None,
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => {
                warn!(error = %e, "retrieval cache read failed; continuing uncached");
                None
            }
        }
    }

    pub fn cache_put(&self, cache_key: &str, result_json: &str, ttl_ms: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();
        conn.execute(
            "INSERT INTO retrieval_cache (cache_key, result_json, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cache_key) DO UPDATE SET
                 result_json = excluded.result_json,
                 created_at  = excluded.created_at,
                 expires_at  = excluded.expires_at",
            rusqlite::params![cache_key, result_json, now, now + ttl_ms],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_are_invisible() {
        let store = Store::open_in_memory().unwrap();
        store.cache_put("k1", "[1,2,3]", 60_000).unwrap();
        assert_eq!(store.cache_get("k1").unwrap(), "[1,2,3]");

        store.cache_put("k2", "[]", -1).unwrap();
        assert!(store.cache_get("k2").is_none());
    }
}
