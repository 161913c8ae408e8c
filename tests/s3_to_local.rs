#[cfg(test)]
mod common;

#[cfg(test)]
mod tests {
    use filetime::{FileTime, set_file_mtime};

    use common::*;

    use super::*;

    const README: &[u8] = b"# readme\nthis is a test.\n";
    const DATA: &[u8] = b"0123456789abcdef";

    fn prepare_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.insert("backup/readme", README);
        store.insert("backup/readme_copy", README);
        store.insert("backup/dir/data.bin", DATA);
        store.insert("other/unrelated", b"unrelated");

        store
    }

    fn mtime_secs(path: &std::path::Path) -> i64 {
        FileTime::from_last_modification_time(&std::fs::metadata(path).unwrap()).unix_seconds()
    }

    #[tokio::test]
    async fn download_prefix_copies_duplicate_content() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = prepare_store();
        let target = tempfile::tempdir().unwrap();

        let report = TestHelper::run(
            &store,
            vec!["s3://test-bucket/backup/", &TestHelper::dir_arg(target.path())],
        )
        .await
        .unwrap();

        assert_eq!(report.transferred, 2);
        assert_eq!(report.copied, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(
            TestHelper::list_files(target.path()),
            vec!["dir/data.bin", "readme", "readme_copy"]
        );
        assert_eq!(std::fs::read(target.path().join("readme_copy")).unwrap(), README);
    }

    #[tokio::test]
    async fn second_download_skips_everything() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = prepare_store();
        let target = tempfile::tempdir().unwrap();
        let target_arg = TestHelper::dir_arg(target.path());

        TestHelper::run(&store, vec!["s3://test-bucket/backup/", &target_arg])
            .await
            .unwrap();
        let report = TestHelper::run(&store, vec!["s3://test-bucket/backup/", &target_arg])
            .await
            .unwrap();

        assert_eq!(report.transferred + report.copied, 0);
        assert_eq!(report.skipped, 3);
    }

    #[tokio::test]
    async fn download_into_missing_directory() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = prepare_store();
        let target = tempfile::tempdir().unwrap();
        let target_arg = TestHelper::dir_arg(&target.path().join("new/nested"));

        TestHelper::run(&store, vec!["s3://test-bucket/backup/", &target_arg])
            .await
            .unwrap();

        assert_eq!(
            TestHelper::list_files(&target.path().join("new/nested")),
            vec!["dir/data.bin", "readme", "readme_copy"]
        );
    }

    #[tokio::test]
    async fn download_prefix_without_trailing_slash_keeps_its_name() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = prepare_store();
        let target = tempfile::tempdir().unwrap();

        TestHelper::run(
            &store,
            vec!["s3://test-bucket/backup", &TestHelper::dir_arg(target.path())],
        )
        .await
        .unwrap();

        assert_eq!(
            TestHelper::list_files(target.path()),
            vec!["backup/dir/data.bin", "backup/readme", "backup/readme_copy"]
        );
    }

    #[tokio::test]
    async fn stale_local_file_is_deleted() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = prepare_store();
        let target = tempfile::tempdir().unwrap();
        TestHelper::write_file(target.path(), "stale.txt", b"stale");
        TestHelper::write_file(target.path(), "dir/old.bin", b"old");
        let target_arg = TestHelper::dir_arg(target.path());

        let report = TestHelper::run(&store, vec!["s3://test-bucket/backup/", &target_arg])
            .await
            .unwrap();
        assert_eq!(report.deleted, 0);
        assert!(target.path().join("stale.txt").exists());

        let report = TestHelper::run(
            &store,
            vec!["--delete-removed", "s3://test-bucket/backup/", &target_arg],
        )
        .await
        .unwrap();

        assert_eq!(report.deleted, 2);
        assert_eq!(
            TestHelper::list_files(target.path()),
            vec!["dir/data.bin", "readme", "readme_copy"]
        );
    }

    #[tokio::test]
    async fn modified_local_file_is_restored() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = prepare_store();
        let target = tempfile::tempdir().unwrap();
        let target_arg = TestHelper::dir_arg(target.path());

        TestHelper::run(&store, vec!["s3://test-bucket/backup/", &target_arg])
            .await
            .unwrap();
        TestHelper::write_file(target.path(), "dir/data.bin", b"fedcba9876543210");

        let report = TestHelper::run(&store, vec!["s3://test-bucket/backup/", &target_arg])
            .await
            .unwrap();

        assert_eq!(report.transferred, 1);
        assert_eq!(std::fs::read(target.path().join("dir/data.bin")).unwrap(), DATA);
    }

    #[tokio::test]
    async fn single_object_is_saved_under_another_name() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = prepare_store();
        let target = tempfile::tempdir().unwrap();
        let target_arg = target
            .path()
            .join("renamed.md")
            .to_string_lossy()
            .to_string();

        let report = TestHelper::run(&store, vec!["s3://test-bucket/backup/readme", &target_arg])
            .await
            .unwrap();

        assert_eq!(report.transferred, 1);
        assert_eq!(TestHelper::list_files(target.path()), vec!["renamed.md"]);
        assert_eq!(std::fs::read(target.path().join("renamed.md")).unwrap(), README);
    }

    #[tokio::test]
    async fn single_object_into_directory() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = prepare_store();
        let target = tempfile::tempdir().unwrap();

        TestHelper::run(
            &store,
            vec![
                "s3://test-bucket/backup/readme",
                &TestHelper::dir_arg(target.path()),
            ],
        )
        .await
        .unwrap();

        assert_eq!(TestHelper::list_files(target.path()), vec!["readme"]);
    }

    #[tokio::test]
    async fn wildcard_selects_objects_and_spares_siblings() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = InMemoryStore::new();
        store.insert("docs/a.md", b"a");
        store.insert("docs/b.txt", b"b");
        store.insert("docs/sub/c.md", b"c");
        let target = tempfile::tempdir().unwrap();
        TestHelper::write_file(target.path(), "local.txt", b"local");

        TestHelper::run(
            &store,
            vec![
                "--delete-removed",
                "s3://test-bucket/docs/*.md",
                &TestHelper::dir_arg(target.path()),
            ],
        )
        .await
        .unwrap();

        assert_eq!(
            TestHelper::list_files(target.path()),
            vec!["a.md", "local.txt"]
        );
    }

    #[tokio::test]
    async fn composite_e_tag_without_attributes_is_compared_by_size() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = InMemoryStore::new();
        let data = TestHelper::sized_data(100, 3);
        store.insert_multipart("backup/big.bin", &data, 40);
        let target = tempfile::tempdir().unwrap();
        let target_arg = TestHelper::dir_arg(target.path());

        let report = TestHelper::run(&store, vec!["s3://test-bucket/backup/", &target_arg])
            .await
            .unwrap();
        assert_eq!(report.transferred, 1);
        assert_eq!(report.e_tag_verified, 0);
        assert_eq!(std::fs::read(target.path().join("big.bin")).unwrap(), data);

        let report = TestHelper::run(&store, vec!["s3://test-bucket/backup/", &target_arg])
            .await
            .unwrap();
        assert_eq!(report.transferred, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn mtime_follows_object() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = prepare_store();
        let target = tempfile::tempdir().unwrap();

        TestHelper::run(
            &store,
            vec!["s3://test-bucket/backup/", &TestHelper::dir_arg(target.path())],
        )
        .await
        .unwrap();

        let last_modified = store.object("backup/readme").unwrap().last_modified;
        assert_eq!(
            mtime_secs(&target.path().join("readme")),
            last_modified.timestamp()
        );
    }

    #[tokio::test]
    async fn mtime_survives_round_trip() {
        TestHelper::init_dummy_tracing_subscriber();

        let source = tempfile::tempdir().unwrap();
        let path = TestHelper::write_file(source.path(), "readme", README);
        set_file_mtime(&path, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
        let store = InMemoryStore::new();

        TestHelper::run(
            &store,
            vec![&TestHelper::dir_arg(source.path()), "s3://test-bucket/backup/"],
        )
        .await
        .unwrap();

        let target = tempfile::tempdir().unwrap();
        TestHelper::run(
            &store,
            vec!["s3://test-bucket/backup/", &TestHelper::dir_arg(target.path())],
        )
        .await
        .unwrap();

        assert_eq!(mtime_secs(&target.path().join("readme")), 1_600_000_000);
    }

    #[tokio::test]
    async fn key_escaping_target_is_rejected() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = InMemoryStore::new();
        store.insert("backup/../escape-6329313", b"evil");
        store.insert("backup/fine", b"fine");
        let parent = tempfile::tempdir().unwrap();
        let target = parent.path().join("target");
        std::fs::create_dir(&target).unwrap();

        let report = TestHelper::run(
            &store,
            vec!["s3://test-bucket/backup/", &TestHelper::dir_arg(&target)],
        )
        .await
        .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.transferred, 1);
        assert!(!parent.path().join("escape-6329313").exists());
        assert_eq!(TestHelper::list_files(&target), vec!["fine"]);
    }

    #[tokio::test]
    async fn listing_is_paginated_by_max_keys() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = prepare_store();
        let target = tempfile::tempdir().unwrap();

        let report = TestHelper::run(
            &store,
            vec![
                "--max-keys",
                "1",
                "s3://test-bucket/backup/",
                &TestHelper::dir_arg(target.path()),
            ],
        )
        .await
        .unwrap();

        let requests = store.list_requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|request| request.max_keys == 1));
        assert_eq!(requests[0].continuation, None);
        assert_eq!(requests[1].continuation, Some("backup/dir/data.bin".to_string()));
        assert_eq!(report.transferred + report.copied, 3);
    }

    #[tokio::test]
    async fn dry_run_downloads_nothing() {
        TestHelper::init_dummy_tracing_subscriber();

        let store = prepare_store();
        let target = tempfile::tempdir().unwrap();

        let report = TestHelper::run(
            &store,
            vec![
                "--dry-run",
                "s3://test-bucket/backup/",
                &TestHelper::dir_arg(target.path()),
            ],
        )
        .await
        .unwrap();

        assert_eq!(report.planned, 3);
        assert!(TestHelper::list_files(target.path()).is_empty());
    }
}
