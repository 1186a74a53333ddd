//! Storage locations behind the `object_store` abstraction.
//!
//! The pipeline treats locations as opaque: a location is either a local
//! directory or an object-store URI (`s3://`, `gs://`, `azure://`,
//! `https://`). A [`FileStore`] owns the three locations of one run
//! (source, archive, duplicates) and exposes the operations the runner
//! needs: scan, stream, copy to archive, move to duplicates, delete.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::http::HttpBuilder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as StorePath;
use object_store::ObjectStore;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use tabload_core::{LoadError, Platform};

/// One resolved storage location: a store plus a prefix within it.
pub struct StoreLocation {
    store: Arc<dyn ObjectStore>,
    prefix: StorePath,
    /// Original URI or path, kept for log lines.
    raw: String,
}

impl std::fmt::Debug for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLocation").field("raw", &self.raw).finish()
    }
}

impl StoreLocation {
    /// Route a location string to a store implementation.
    ///
    /// URI schemes pick the backend directly; `https://` is ambiguous
    /// (every cloud vendor serves blobs over plain HTTPS), so the platform
    /// hint decides. Anything without a scheme is a local directory.
    pub fn resolve(location: &str, platform: Platform) -> Result<Self, LoadError> {
        if let Ok(url) = url::Url::parse(location) {
            let prefix = StorePath::from_url_path(url.path().trim_start_matches('/'))
                .map_err(|e| LoadError::Config(format!("invalid location path {location}: {e}")))?;
            let store: Arc<dyn ObjectStore> = match url.scheme() {
                "s3" => Arc::new(
                    AmazonS3Builder::from_env()
                        .with_url(location)
                        .build()
                        .map_err(|e| LoadError::storage("resolving s3 location", e))?,
                ),
                "gs" => Arc::new(
                    GoogleCloudStorageBuilder::from_env()
                        .with_url(location)
                        .build()
                        .map_err(|e| LoadError::storage("resolving gcs location", e))?,
                ),
                "azure" | "az" | "abfs" | "abfss" => Arc::new(
                    MicrosoftAzureBuilder::from_env()
                        .with_url(location)
                        .build()
                        .map_err(|e| LoadError::storage("resolving azure location", e))?,
                ),
                "https" => match platform {
                    Platform::Aws => Arc::new(
                        AmazonS3Builder::from_env()
                            .with_url(location)
                            .build()
                            .map_err(|e| LoadError::storage("resolving s3 location", e))?,
                    ),
                    Platform::Gcp => Arc::new(
                        GoogleCloudStorageBuilder::from_env()
                            .with_url(location)
                            .build()
                            .map_err(|e| LoadError::storage("resolving gcs location", e))?,
                    ),
                    Platform::Azure => Arc::new(
                        MicrosoftAzureBuilder::from_env()
                            .with_url(location)
                            .build()
                            .map_err(|e| LoadError::storage("resolving azure location", e))?,
                    ),
                    Platform::Default => Arc::new(
                        HttpBuilder::new()
                            .with_url(location)
                            .build()
                            .map_err(|e| LoadError::storage("resolving http location", e))?,
                    ),
                },
                "file" => {
                    let store = LocalFileSystem::new_with_prefix(url.path())
                        .map_err(|e| LoadError::storage("resolving local location", e))?;
                    return Ok(Self {
                        store: Arc::new(store),
                        prefix: StorePath::default(),
                        raw: location.to_string(),
                    });
                }
                other => {
                    return Err(LoadError::Config(format!(
                        "unsupported storage scheme {other}:// in {location}"
                    )))
                }
            };
            Ok(Self {
                store,
                prefix,
                raw: location.to_string(),
            })
        } else {
            let store = LocalFileSystem::new_with_prefix(location)
                .map_err(|e| LoadError::storage("resolving local location", e))?;
            Ok(Self {
                store: Arc::new(store),
                prefix: StorePath::default(),
                raw: location.to_string(),
            })
        }
    }

    fn object(&self, filename: &str) -> StorePath {
        if self.prefix.parts().next().is_none() {
            StorePath::from(filename)
        } else {
            self.prefix.child(filename)
        }
    }
}

/// The three locations of one run and the operations over them.
///
/// All operations are safe for concurrent use by the worker pool; errors
/// are transient storage errors unless stated otherwise.
#[derive(Debug)]
pub struct FileStore {
    source: StoreLocation,
    archive: StoreLocation,
    duplicates: StoreLocation,
}

impl FileStore {
    pub fn new(source: StoreLocation, archive: StoreLocation, duplicates: StoreLocation) -> Self {
        Self {
            source,
            archive,
            duplicates,
        }
    }

    pub fn resolve(
        source: &str,
        archive: &str,
        duplicates: &str,
        platform: Platform,
    ) -> Result<Self, LoadError> {
        Ok(Self::new(
            StoreLocation::resolve(source, platform)?,
            StoreLocation::resolve(archive, platform)?,
            StoreLocation::resolve(duplicates, platform)?,
        ))
    }

    /// Direct children of the source location, dotfiles skipped.
    pub async fn scan(&self) -> Result<Vec<String>, LoadError> {
        let prefix = if self.source.prefix.parts().next().is_none() {
            None
        } else {
            Some(&self.source.prefix)
        };
        let listing = self
            .source
            .store
            .list_with_delimiter(prefix)
            .await
            .map_err(|e| LoadError::storage("listing source location", e))?;
        let mut files: Vec<String> = listing
            .objects
            .into_iter()
            .filter_map(|meta| meta.location.filename().map(str::to_string))
            .filter(|name| !name.starts_with('.'))
            .collect();
        files.sort();
        debug!(location = %self.source.raw, count = files.len(), "scanned source location");
        Ok(files)
    }

    /// Open a byte stream over a source file.
    pub async fn stream(
        &self,
        filename: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, LoadError> {
        let path = self.source.object(filename);
        let result = self
            .source
            .store
            .get(&path)
            .await
            .map_err(|e| LoadError::storage(format!("opening {filename}"), e))?;
        let stream = result
            .into_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(stream)))
    }

    /// Fetch a whole source file into memory. Used by formats that need
    /// random access (Excel workbooks, Parquet footers).
    pub async fn fetch(&self, filename: &str) -> Result<Bytes, LoadError> {
        let path = self.source.object(filename);
        let result = self
            .source
            .store
            .get(&path)
            .await
            .map_err(|e| LoadError::storage(format!("opening {filename}"), e))?;
        result
            .bytes()
            .await
            .map_err(|e| LoadError::storage(format!("reading {filename}"), e))
    }

    /// Copy the source file into the archive location, overwriting any
    /// previous archive copy of the same name.
    pub async fn copy_to_archive(&self, filename: &str) -> Result<(), LoadError> {
        copy_across(&self.source, filename, &self.archive, filename).await?;
        info!(file = filename, archive = %self.archive.raw, "archived source file");
        Ok(())
    }

    /// Move the source file into the duplicates location. A name collision
    /// at the destination is resolved with a UTC `YYYYMMDD_HHmmss` suffix
    /// inserted before the extension.
    pub async fn move_to_duplicates(&self, filename: &str) -> Result<(), LoadError> {
        let mut dest_name = filename.to_string();
        let dest = self.duplicates.object(filename);
        if self.duplicates.store.head(&dest).await.is_ok() {
            dest_name = timestamped_name(filename, &Utc::now().format("%Y%m%d_%H%M%S").to_string());
        }
        copy_across(&self.source, filename, &self.duplicates, &dest_name).await?;
        self.delete(filename).await?;
        info!(file = filename, dest = dest_name, "moved duplicate file");
        Ok(())
    }

    /// Delete the source file. Deleting a file that is already gone is not
    /// an error; terminal failure handling relies on that.
    pub async fn delete(&self, filename: &str) -> Result<(), LoadError> {
        let path = self.source.object(filename);
        match self.source.store.delete(&path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(LoadError::storage(format!("deleting {filename}"), e)),
        }
    }
}

/// Stream an object between two locations without buffering it whole.
async fn copy_across(
    from: &StoreLocation,
    from_name: &str,
    to: &StoreLocation,
    to_name: &str,
) -> Result<(), LoadError> {
    let context = format!("copying {from_name} to {}", to.raw);
    let src = from.object(from_name);
    let dst = to.object(to_name);

    let result = from
        .store
        .get(&src)
        .await
        .map_err(|e| LoadError::storage(context.as_str(), e))?;
    let stream = result
        .into_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let mut reader = StreamReader::new(stream);

    let (_id, mut writer) = to
        .store
        .put_multipart(&dst)
        .await
        .map_err(|e| LoadError::storage(context.as_str(), e))?;
    tokio::io::copy(&mut reader, &mut writer)
        .await
        .map_err(|e| LoadError::storage(context.as_str(), e))?;
    writer
        .shutdown()
        .await
        .map_err(|e| LoadError::storage(context.as_str(), e))?;
    Ok(())
}

/// Insert a timestamp suffix before the final extension:
/// `sales.csv.gz` becomes `sales.csv_20240101_120000.gz`.
fn timestamped_name(filename: &str, timestamp: &str) -> String {
    match filename.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{timestamp}{}", &filename[..dot], &filename[dot..]),
        _ => format!("{filename}_{timestamp}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    fn local_store(root: &Path) -> FileStore {
        let source = root.join("incoming");
        let archive = root.join("archive");
        let duplicates = root.join("duplicates");
        for dir in [&source, &archive, &duplicates] {
            std::fs::create_dir_all(dir).unwrap();
        }
        FileStore::resolve(
            source.to_str().unwrap(),
            archive.to_str().unwrap(),
            duplicates.to_str().unwrap(),
            Platform::Default,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn scan_skips_dotfiles() {
        let tmp = tempfile::tempdir().unwrap();
        let store = local_store(tmp.path());
        let incoming = tmp.path().join("incoming");
        write(&incoming, "sales_1.csv", "a,b\n");
        write(&incoming, ".hidden", "x");
        write(&incoming, "sales_2.csv", "a,b\n");

        let files = store.scan().await.unwrap();
        assert_eq!(files, vec!["sales_1.csv", "sales_2.csv"]);
    }

    #[tokio::test]
    async fn archive_copy_and_delete_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = local_store(tmp.path());
        write(&tmp.path().join("incoming"), "sales.csv", "a,b\n1,2\n");

        store.copy_to_archive("sales.csv").await.unwrap();
        assert!(tmp.path().join("archive/sales.csv").exists());

        store.delete("sales.csv").await.unwrap();
        assert!(!tmp.path().join("incoming/sales.csv").exists());
        // Idempotent
        store.delete("sales.csv").await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_move_appends_timestamp_on_collision() {
        let tmp = tempfile::tempdir().unwrap();
        let store = local_store(tmp.path());
        write(&tmp.path().join("incoming"), "sales.csv", "new");
        write(&tmp.path().join("duplicates"), "sales.csv", "old");

        store.move_to_duplicates("sales.csv").await.unwrap();
        assert!(!tmp.path().join("incoming/sales.csv").exists());

        let names: Vec<String> = std::fs::read_dir(tmp.path().join("duplicates"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.starts_with("sales_") && n.ends_with(".csv")));
    }

    #[test]
    fn timestamp_suffix_goes_before_the_extension() {
        assert_eq!(
            timestamped_name("sales.csv", "20240101_120000"),
            "sales_20240101_120000.csv"
        );
        assert_eq!(
            timestamped_name("sales.csv.gz", "20240101_120000"),
            "sales.csv_20240101_120000.gz"
        );
        assert_eq!(timestamped_name("noext", "20240101_120000"), "noext_20240101_120000");
    }
}
