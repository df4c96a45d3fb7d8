use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::{resolve_under_root, Config};
use crate::ids::uuid5_str;

const WRITE_CHUNK: usize = 16 * 1024 * 1024;

/// Persist one upload under a fresh random subdirectory and hand back the
/// public URI the access endpoint serves it from.
pub async fn store(config: &Config, file_name: &str, bytes: &[u8]) -> Result<String> {
    let subdir = Uuid::new_v4().to_string();
    let folder = config.fs_root.join(&subdir);
    tokio::fs::create_dir_all(&folder)
        .await
        .with_context(|| format!("failed to create blob directory {}", folder.display()))?;

    let path = folder.join(file_name);
    let mut file = tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("failed to create blob file {}", path.display()))?;
    for chunk in bytes.chunks(WRITE_CHUNK) {
        file.write_all(chunk).await?;
    }
    file.flush().await?;

    Ok(format!(
        "{}/access/{}/{}",
        config.main_site, subdir, file_name
    ))
}

/// Plain component files are packed into a deterministic tarball before
/// staging: the archive name is the UUIDv5 of the concatenated member names.
pub async fn pack(config: &Config, files: &[(String, Vec<u8>)]) -> Result<String> {
    let token: String = files.iter().map(|(name, _)| name.as_str()).collect();
    let archive_name = format!("{}.tar.gz", uuid5_str(&token));

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, bytes) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, bytes.as_slice())
            .with_context(|| format!("failed to pack {name}"))?;
    }
    let encoder = builder.into_inner().context("failed to finish tarball")?;
    let bytes = encoder.finish().context("failed to finish gzip stream")?;

    store(config, &archive_name, &bytes).await
}

enum Source {
    Local { path: PathBuf },
    Remote { auth_token: Option<String> },
}

/// Scoped handle over a staged blob. The blob is released explicitly through
/// [`FileProxy::exit`]: on a successful run the underlying file is deleted
/// (and its subdirectory pruned) or a DELETE is issued to the remote site; on
/// a failed run the blob stays put so a retry finds it intact, unless the
/// caller opted into `always_delete_on_exit`.
pub struct FileProxy {
    uri: String,
    file_name: String,
    data: Vec<u8>,
    source: Source,
    always_delete_on_exit: bool,
    http: reqwest::Client,
}

impl FileProxy {
    pub async fn fetch(
        config: &Config,
        http: &reqwest::Client,
        uri: &str,
        auth_token: Option<&str>,
        always_delete_on_exit: bool,
    ) -> Result<Self> {
        let file_name = uri
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .context("blob URI has no file name")?
            .to_string();

        let (data, source) = if config.is_local_uri(uri) {
            let relative = uri
                .strip_prefix(&config.main_site)
                .and_then(|rest| rest.strip_prefix("/access/"))
                .context("malformed local blob URI")?;
            let path = resolve_under_root(&config.fs_root, relative)?;
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read blob {}", path.display()))?;
            (data, Source::Local { path })
        } else {
            let mut request = http.get(uri);
            if let Some(token) = auth_token {
                request = request.bearer_auth(token);
            }
            let resp = request
                .send()
                .await
                .with_context(|| format!("failed to fetch remote blob {uri}"))?;
            if !resp.status().is_success() {
                anyhow::bail!("remote blob fetch returned {}", resp.status());
            }
            let data = resp.bytes().await?.to_vec();
            (
                data,
                Source::Remote {
                    auth_token: auth_token.map(str::to_string),
                },
            )
        };

        Ok(Self {
            uri: uri.to_string(),
            file_name,
            data,
            source,
            always_delete_on_exit,
            http: http.clone(),
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Release on the way out. Deletion failures are logged, never raised:
    /// the parse result matters more than the cleanup.
    pub async fn exit(self, success: bool) {
        if !success && !self.always_delete_on_exit {
            return;
        }
        match self.source {
            Source::Local { path } => {
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %err, "failed to delete blob");
                    return;
                }
                if let Some(parent) = path.parent() {
                    // ignore failures: the directory may hold other uploads
                    let _ = tokio::fs::remove_dir(parent).await;
                }
            }
            Source::Remote { auth_token } => {
                let mut request = self.http.delete(&self.uri);
                if let Some(token) = auth_token {
                    request = request.bearer_auth(token);
                }
                match request.send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => {
                        tracing::warn!(uri = %self.uri, status = %resp.status(), "remote blob delete rejected")
                    }
                    Err(err) => {
                        tracing::warn!(uri = %self.uri, error = %err, "remote blob delete failed")
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_config;

    #[tokio::test]
    async fn store_writes_under_fresh_subdirectory() {
        let config = test_config();
        let uri = store(&config, "jp_test.knt.tar.gz", b"payload")
            .await
            .unwrap();
        assert!(uri.starts_with(&format!("{}/access/", config.main_site)));
        assert!(uri.ends_with("/jp_test.knt.tar.gz"));

        let relative = uri
            .strip_prefix(&format!("{}/access/", config.main_site))
            .unwrap();
        let path = config.fs_root.join(relative);
        assert_eq!(std::fs::read(path).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn pack_name_is_deterministic() {
        let config = test_config();
        let files = vec![
            ("A.V2A".to_string(), b"aaa".to_vec()),
            ("B.V1A".to_string(), b"bbb".to_vec()),
        ];
        let first = pack(&config, &files).await.unwrap();
        let second = pack(&config, &files).await.unwrap();
        let name = |uri: &str| uri.rsplit('/').next().unwrap().to_string();
        assert_eq!(name(&first), name(&second));
        assert!(first.ends_with(".tar.gz"));
    }

    #[tokio::test]
    async fn proxy_releases_blob_and_prunes_directory_on_success() {
        let config = test_config();
        let uri = store(&config, "x.tar.gz", b"data").await.unwrap();
        let http = reqwest::Client::new();

        let proxy = FileProxy::fetch(&config, &http, &uri, None, false)
            .await
            .unwrap();
        assert_eq!(proxy.file_name(), "x.tar.gz");
        assert_eq!(proxy.data(), b"data");

        let relative = uri
            .strip_prefix(&format!("{}/access/", config.main_site))
            .unwrap()
            .to_string();
        let path = config.fs_root.join(&relative);
        proxy.exit(true).await;
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn proxy_keeps_blob_on_failure_for_the_retry() {
        let config = test_config();
        let uri = store(&config, "x.tar.gz", b"data").await.unwrap();
        let http = reqwest::Client::new();

        let proxy = FileProxy::fetch(&config, &http, &uri, None, false)
            .await
            .unwrap();
        let relative = uri
            .strip_prefix(&format!("{}/access/", config.main_site))
            .unwrap()
            .to_string();
        let path = config.fs_root.join(&relative);
        proxy.exit(false).await;
        assert!(path.exists());

        // the local executor always cleans up, failure or not
        let proxy = FileProxy::fetch(&config, &http, &uri, None, true)
            .await
            .unwrap();
        proxy.exit(false).await;
        assert!(!path.exists());
    }
}
