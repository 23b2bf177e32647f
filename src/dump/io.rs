use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};

use super::DumpError;

/// Streaming endpoint handed to the domain serializer.
///
/// Bytes go to a temporary file next to the final location; finishing the
/// writer flushes, syncs and atomically renames it into place, so a crashed or
/// cancelled dump never leaves a half-written file under the dump name.
#[derive(Debug)]
pub struct DumpWriter {
    file: BufWriter<File>,
    temp_path: TempPath,
    final_path: PathBuf,
    bytes_written: u64,
}

impl DumpWriter {
    pub(crate) async fn create(final_path: PathBuf) -> Result<Self, DumpError> {
        let dir = final_path
            .parent()
            .ok_or_else(|| DumpError::Malformed("dump path has no parent directory".into()))?;
        let temp_file = tempfile::Builder::new()
            .prefix("tmp-dump")
            .tempfile_in(dir)
            .map_err(DumpError::Io)?;
        let (std_file, temp_path) = temp_file.into_parts();
        Ok(DumpWriter {
            file: BufWriter::new(File::from_std(std_file)),
            temp_path,
            final_path,
            bytes_written: 0,
        })
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), DumpError> {
        self.file.write_all(data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Completes the dump and returns the number of bytes written.
    pub(crate) async fn finish(self) -> Result<u64, DumpError> {
        let DumpWriter {
            mut file,
            temp_path,
            final_path,
            bytes_written,
        } = self;
        file.flush().await?;
        let file = file.into_inner();
        file.sync_all().await?;
        drop(file);
        temp_path
            .persist(&final_path)
            .map_err(|err| DumpError::Io(err.error))?;
        Ok(bytes_written)
    }
}

/// Streaming endpoint handed to the domain deserializer.
#[derive(Debug)]
pub struct DumpReader {
    file: BufReader<File>,
}

impl DumpReader {
    pub(crate) async fn open(path: &Path) -> Result<Self, DumpError> {
        let file = File::open(path).await?;
        Ok(DumpReader {
            file: BufReader::new(file),
        })
    }

    pub async fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize, DumpError> {
        Ok(self.file.read_to_end(buf).await?)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DumpError> {
        self.file.read_exact(buf).await?;
        Ok(())
    }

    /// Verifies that the deserializer consumed the whole dump.
    pub(crate) async fn finish(mut self) -> Result<(), DumpError> {
        let mut probe = [0u8; 1];
        match self.file.read(&mut probe).await? {
            0 => Ok(()),
            _ => Err(DumpError::Malformed(
                "dump file has trailing data after deserialization".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_persist_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.dump");

        let mut writer = DumpWriter::create(path.clone()).await.unwrap();
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"dump").await.unwrap();
        let size = writer.finish().await.unwrap();
        assert_eq!(size, 10);

        let mut reader = DumpReader::open(&path).await.unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"hello dump");
        reader.finish().await.unwrap();
    }

    #[tokio::test]
    async fn unfinished_writer_leaves_no_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped.dump");

        let mut writer = DumpWriter::create(path.clone()).await.unwrap();
        writer.write_all(b"partial").await.unwrap();
        drop(writer);

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn finish_rejects_trailing_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trailing.dump");

        let mut writer = DumpWriter::create(path.clone()).await.unwrap();
        writer.write_all(b"payload and change").await.unwrap();
        writer.finish().await.unwrap();

        let mut reader = DumpReader::open(&path).await.unwrap();
        let mut prefix = [0u8; 7];
        reader.read_exact(&mut prefix).await.unwrap();
        assert!(matches!(
            reader.finish().await,
            Err(DumpError::Malformed(_))
        ));
    }
}
