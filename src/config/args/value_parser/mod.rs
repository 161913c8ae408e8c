pub mod file_exist;
pub mod human_bytes;
pub mod regex;
pub mod storage_path;
pub mod url;
