use std::path::PathBuf;

pub fn is_file_exist(file_path: &str) -> Result<String, String> {
    let path = PathBuf::from(file_path);

    if path.is_file() {
        Ok(file_path.to_string())
    } else {
        Err(format!("file does not exist: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn existing_file() {
        init_dummy_tracing_subscriber();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "docs/readme.txt").unwrap();

        let path = file.path().to_string_lossy().to_string();
        assert_eq!(is_file_exist(&path).unwrap(), path);
    }

    #[test]
    fn missing_file_or_directory() {
        init_dummy_tracing_subscriber();

        assert!(is_file_exist("./no_such_file_list.txt").is_err());

        let dir = tempfile::tempdir().unwrap();
        assert!(is_file_exist(&dir.path().to_string_lossy()).is_err());
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("dummy=trace")
            .try_init();
    }
}
