//! Database image export and restore
//! Moves the whole SQLite image between a live in-memory handle and raw
//! bytes, via a scratch file and the engine's backup mechanism

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::backup::Backup;
use rusqlite::Connection;

use crate::error::StoreError;

/// Pages copied per backup step; images here are a handful of pages.
const PAGES_PER_STEP: i32 = 64;

/// Scratch file path for moving an image through the filesystem
fn scratch_path() -> PathBuf {
    std::env::temp_dir().join(format!("goal_store_{}.db", uuid::Uuid::new_v4()))
}

/// Serialize the full database image to raw bytes
pub fn export(conn: &Connection) -> Result<Vec<u8>, StoreError> {
    let path = scratch_path();

    let result: Result<Vec<u8>, StoreError> = (|| {
        let mut file_conn = Connection::open(&path)?;
        {
            let backup = Backup::new(conn, &mut file_conn)?;
            backup.run_to_completion(PAGES_PER_STEP, Duration::from_millis(0), None)?;
        }
        // Close before reading so the image is fully flushed
        file_conn.close().map_err(|(_, err)| err)?;
        Ok(std::fs::read(&path)?)
    })();

    // Clean up scratch file
    let _ = std::fs::remove_file(&path);

    result
}

/// Rebuild a live in-memory handle from raw image bytes
pub fn restore(image: &[u8]) -> Result<Connection, StoreError> {
    let path = scratch_path();

    let result: Result<Connection, StoreError> = (|| {
        std::fs::write(&path, image)?;
        let file_conn = Connection::open(&path)?;
        let mut conn = Connection::open_in_memory()?;
        {
            let backup = Backup::new(&file_conn, &mut conn)?;
            backup.run_to_completion(PAGES_PER_STEP, Duration::from_millis(0), None)?;
        }
        Ok(conn)
    })();

    let _ = std::fs::remove_file(&path);

    result
}

/// Encode image bytes for the durable slot as a JSON array of byte values
pub fn encode(image: &[u8]) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(image)?)
}

/// Decode a slot entry back into image bytes
pub fn decode(raw: &[u8]) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::from_slice(raw)?)
}
