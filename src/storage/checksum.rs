use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use dyn_clone::DynClone;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::types::ContentHash;

const READ_BUFFER_SIZE: usize = 1024 * 1024;

pub type ContentHasher = Box<dyn ContentHasherTrait + Send + Sync>;

/// Hashes the whole content of a local file.
#[async_trait]
pub trait ContentHasherTrait: DynClone {
    async fn hash_file(&self, path: &Path) -> std::io::Result<ContentHash>;
}

#[derive(Clone, Default)]
pub struct Md5ContentHasher;

impl Md5ContentHasher {
    pub fn boxed_new() -> ContentHasher {
        Box::new(Md5ContentHasher {})
    }
}

#[async_trait]
impl ContentHasherTrait for Md5ContentHasher {
    async fn hash_file(&self, path: &Path) -> std::io::Result<ContentHash> {
        md5_hex_from_path(path).await
    }
}

pub async fn md5_hex_from_path(path: &Path) -> std::io::Result<ContentHash> {
    let mut file = File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read_bytes = file.read(&mut buffer).await?;
        if read_bytes == 0 {
            break;
        }
        context.consume(&buffer[..read_bytes]);
    }

    let digest: md5::Digest = context.into();
    Ok(format!("{digest:x}"))
}

pub fn md5_hex(data: &[u8]) -> ContentHash {
    format!("{:x}", md5::compute(data))
}

pub fn md5_base64(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(md5::compute(data).as_slice())
}

pub fn is_multipart_upload_e_tag(e_tag: &Option<String>) -> bool {
    match e_tag {
        Some(e_tag) => e_tag.contains('-'),
        None => false,
    }
}

pub fn normalize_e_tag(e_tag: &Option<String>) -> Option<String> {
    e_tag
        .as_ref()
        .map(|e_tag| e_tag.replace('\"', "").to_ascii_lowercase())
}

/// ETag that the store reports for an object assembled from parts with the given MD5 digests.
pub fn generate_multipart_e_tag(part_md5_hex_digests: &[String]) -> Result<String> {
    let mut concatenated_md5_hash = Vec::with_capacity(part_md5_hex_digests.len() * 16);
    for digest in part_md5_hex_digests {
        concatenated_md5_hash.append(
            &mut hex::decode(digest).with_context(|| format!("invalid md5 digest: {digest}"))?,
        );
    }

    Ok(format!(
        "{:x}-{}",
        md5::compute(&concatenated_md5_hash),
        part_md5_hex_digests.len()
    ))
}

/// Attributes stored in user metadata so that a whole-file hash survives multipart upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentAttributes {
    pub md5: Option<ContentHash>,
    pub size: Option<u64>,
    pub mtime: Option<i64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl ContentAttributes {
    pub fn encode(&self) -> String {
        let mut fields = Vec::new();
        if let Some(md5) = &self.md5 {
            fields.push(format!("md5:{md5}"));
        }
        if let Some(size) = self.size {
            fields.push(format!("size:{size}"));
        }
        if let Some(mtime) = self.mtime {
            fields.push(format!("mtime:{mtime}"));
        }
        if let Some(uid) = self.uid {
            fields.push(format!("uid:{uid}"));
        }
        if let Some(gid) = self.gid {
            fields.push(format!("gid:{gid}"));
        }

        fields.join("/")
    }

    /// Unknown or malformed fields are ignored.
    pub fn parse(value: &str) -> Self {
        let mut attributes = ContentAttributes::default();
        for field in value.split('/') {
            let Some((name, value)) = field.split_once(':') else {
                continue;
            };
            match name {
                "md5" if is_md5_hex(value) => attributes.md5 = Some(value.to_ascii_lowercase()),
                "size" => attributes.size = value.parse().ok(),
                "mtime" => attributes.mtime = value.parse().ok(),
                "uid" => attributes.uid = value.parse().ok(),
                "gid" => attributes.gid = value.parse().ok(),
                _ => {}
            }
        }

        attributes
    }
}

fn is_md5_hex(value: &str) -> bool {
    value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";
    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

    #[test]
    fn normalize_e_tag_test() {
        init_dummy_tracing_subscriber();

        assert_eq!(normalize_e_tag(&None), None);
        assert_eq!(
            normalize_e_tag(&Some("\"b7c136b1987c972de7d0808e12221abe\"".to_string())),
            Some("b7c136b1987c972de7d0808e12221abe".to_string())
        );
        assert_eq!(
            normalize_e_tag(&Some("b7c136b1987c972de7d0808e12221abe".to_string())),
            Some("b7c136b1987c972de7d0808e12221abe".to_string())
        );
    }

    #[test]
    fn is_multipart_upload_e_tag_test() {
        init_dummy_tracing_subscriber();

        assert!(!is_multipart_upload_e_tag(&None));
        assert!(!is_multipart_upload_e_tag(&Some(
            "\"b7c136b1987c972de7d0808e12221abe\"".to_string()
        )));
        assert!(is_multipart_upload_e_tag(&Some(
            "b7c136b1987c972de7d0808e12221abe-2".to_string()
        )));
        assert!(is_multipart_upload_e_tag(&Some(
            "\"b7c136b1987c972de7d0808e12221abe-300\"".to_string()
        )));
    }

    #[test]
    fn md5_of_bytes() {
        init_dummy_tracing_subscriber();

        assert_eq!(md5_hex(b""), EMPTY_MD5);
        assert_eq!(md5_hex(b"hello"), HELLO_MD5);
        assert_eq!(md5_base64(b"hello"), "XUFAKrxLKna5cZ2REBfFkg==");
    }

    #[tokio::test]
    async fn md5_of_file() {
        init_dummy_tracing_subscriber();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        file.flush().unwrap();

        assert_eq!(md5_hex_from_path(file.path()).await.unwrap(), HELLO_MD5);
        assert_eq!(
            Md5ContentHasher::boxed_new()
                .hash_file(file.path())
                .await
                .unwrap(),
            HELLO_MD5
        );
    }

    #[tokio::test]
    async fn md5_of_missing_file() {
        init_dummy_tracing_subscriber();

        let dir = tempfile::tempdir().unwrap();
        let error = md5_hex_from_path(&dir.path().join("missing"))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn multipart_e_tag() {
        init_dummy_tracing_subscriber();

        let first = md5_hex(b"hello");
        let second = md5_hex(b"world");

        let mut concatenated = md5::compute(b"hello").as_slice().to_vec();
        concatenated.extend_from_slice(md5::compute(b"world").as_slice());
        let expected = format!("{:x}-2", md5::compute(&concatenated));

        assert_eq!(generate_multipart_e_tag(&[first, second]).unwrap(), expected);
        assert!(generate_multipart_e_tag(&["zz".to_string()]).is_err());
    }

    #[test]
    fn content_attributes_encode_and_parse() {
        init_dummy_tracing_subscriber();

        let attributes = ContentAttributes {
            md5: Some(HELLO_MD5.to_string()),
            size: Some(5),
            mtime: Some(1700000000),
            uid: Some(1000),
            gid: Some(100),
        };
        let encoded = attributes.encode();
        assert_eq!(
            encoded,
            format!("md5:{HELLO_MD5}/size:5/mtime:1700000000/uid:1000/gid:100")
        );
        assert_eq!(ContentAttributes::parse(&encoded), attributes);
    }

    #[test]
    fn content_attributes_ignore_garbage() {
        init_dummy_tracing_subscriber();

        let attributes = ContentAttributes::parse("md5:nothex/size:abc/mode:33188/xyz");
        assert_eq!(attributes, ContentAttributes::default());
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("dummy=trace")
            .try_init();
    }
}
