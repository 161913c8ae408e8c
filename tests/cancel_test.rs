#[cfg(test)]
mod common;

#[cfg(test)]
mod tests {
    use s3mirror::pipeline::Pipeline;
    use s3mirror::types::error::is_cancelled_error;
    use s3mirror::types::token::create_sync_cancellation_token;

    use common::*;

    use super::*;

    #[tokio::test]
    async fn cancelled_before_run() {
        TestHelper::init_dummy_tracing_subscriber();

        let source = tempfile::tempdir().unwrap();
        TestHelper::write_file(source.path(), "readme", b"readme");
        let store = InMemoryStore::new();

        let config = TestHelper::build_config(vec![
            &TestHelper::dir_arg(source.path()),
            "s3://test-bucket/backup/",
        ]);
        let token = create_sync_cancellation_token();
        token.cancel();

        let mut pipeline = Pipeline::with_store(config, store.boxed(), token);
        let e = pipeline.run().await.unwrap_err();

        assert!(is_cancelled_error(&e));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn cancelled_download_leaves_no_files() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = InMemoryStore::new();
        store.insert("backup/readme", b"readme");
        let target = tempfile::tempdir().unwrap();

        let config = TestHelper::build_config(vec![
            "s3://test-bucket/backup/",
            &TestHelper::dir_arg(target.path()),
        ]);
        let token = create_sync_cancellation_token();
        token.cancel();

        let mut pipeline = Pipeline::with_store(config, store.boxed(), token);
        assert!(is_cancelled_error(&pipeline.run().await.unwrap_err()));
        assert!(TestHelper::list_files(target.path()).is_empty());
    }

    #[tokio::test]
    async fn pipeline_runs_only_once() {
        TestHelper::init_dummy_tracing_subscriber();

        let source = tempfile::tempdir().unwrap();
        TestHelper::write_file(source.path(), "readme", b"readme");
        let store = InMemoryStore::new();

        let config = TestHelper::build_config(vec![
            &TestHelper::dir_arg(source.path()),
            "s3://test-bucket/backup/",
        ]);
        let mut pipeline =
            Pipeline::with_store(config, store.boxed(), create_sync_cancellation_token());

        pipeline.run().await.unwrap();
        assert!(pipeline.run().await.is_err());
    }
}
