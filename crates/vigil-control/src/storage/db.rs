//! Database connection and initialization.

pub use vigil_core::db::DatabaseError;

vigil_core::define_database!(ControlDatabase, "Control database migrations complete");

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = ControlDatabase::open_in_memory().await;
        assert!(db.is_ok());
    }

    #[tokio::test]
    async fn reopening_a_file_database_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.db");

        let db = ControlDatabase::open(&path).await.unwrap();
        db.upsert_camera("cam-1", "t1", "s1", "rtsp", "rtsp://cam-1", 100)
            .await
            .unwrap();
        db.close().await;

        let reopened = ControlDatabase::open(&path).await.unwrap();
        assert!(reopened.get_camera("cam-1").await.unwrap().is_some());
        reopened.close().await;
    }
}
