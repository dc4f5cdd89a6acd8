//! Payload sources and destinations.
//!
//! The kind of payload is fixed when a job is created. [`Payload`] knows how
//! to size, hash and read each kind; [`Sink`] knows how to write it back.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use log::debug;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::job::{JobId, PayloadKind};
use super::messages::TransferHeader;
use crate::error::Error;

/// Buffer size for streaming hashes over files.
const HASH_BUFFER_SIZE: usize = 64 * 1024;
const PART_SUFFIX: &str = ".part";

/// What a sender transmits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(Vec<u8>),
    File(PathBuf),
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Payload::Text(text.into().into_bytes())
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Text(_) => PayloadKind::Text,
            Payload::File(_) => PayloadKind::File,
        }
    }

    /// Build the transfer header: total size and content hash are computed
    /// up front. Files are hashed in a single streaming pass.
    ///
    /// # Arguments
    /// * `job_id` - Identifier the header is issued under
    /// * `chunk_size` - Size of every chunk except possibly the last
    pub async fn describe(&self, job_id: JobId, chunk_size: u32) -> Result<TransferHeader, Error> {
        let (total_size, content_hash, name) = match self {
            Payload::Text(bytes) => (bytes.len() as u64, Sha256::digest(bytes).into(), String::new()),
            Payload::File(path) => {
                let metadata = fs::metadata(path).await?;
                if !metadata.is_file() {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{} is not a regular file", path.display()),
                    )));
                }
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mut file = File::open(path).await?;
                let (size, hash) = hash_reader(&mut file).await?;
                debug!("Hashed {}: {} bytes", path.display(), size);
                (size, hash, name)
            }
        };

        Ok(TransferHeader {
            job_id,
            kind: self.kind(),
            total_size,
            content_hash,
            chunk_size,
            name,
        })
    }

    pub async fn reader(&self) -> io::Result<ChunkReader> {
        Ok(match self {
            Payload::Text(bytes) => ChunkReader::Text(bytes.clone()),
            Payload::File(path) => ChunkReader::File(File::open(path).await?),
        })
    }
}

/// Random access over a payload, one chunk at a time.
pub enum ChunkReader {
    Text(Vec<u8>),
    File(File),
}

impl ChunkReader {
    /// Read chunk `index` as laid out by `header`.
    ///
    /// Fails with `UnexpectedEof` if the source shrank since it was hashed.
    pub async fn read_chunk(&mut self, header: &TransferHeader, index: u32) -> io::Result<Vec<u8>> {
        let offset = header.offset(index);
        let len = header.chunk_len(index);
        match self {
            ChunkReader::Text(bytes) => {
                let start = offset as usize;
                bytes
                    .get(start..start + len)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "text chunk out of range"))
            }
            ChunkReader::File(file) => {
                let mut buffer = vec![0u8; len];
                file.seek(SeekFrom::Start(offset)).await?;
                file.read_exact(&mut buffer).await?;
                Ok(buffer)
            }
        }
    }
}

/// Where the receiver puts an accepted payload. TEXT goes to memory, FILE to
/// a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Memory,
    File(PathBuf),
}

impl Destination {
    /// The default: memory for TEXT, `download_dir/<sanitised name>` for FILE.
    pub fn default_for(header: &TransferHeader, download_dir: &Path) -> Self {
        match header.kind {
            PayloadKind::Text => Destination::Memory,
            PayloadKind::File => {
                Destination::File(download_dir.join(sanitize_name(&header.name, header.job_id)))
            }
        }
    }

    pub fn check(&self, kind: PayloadKind) -> Result<(), Error> {
        match (self, kind) {
            (Destination::Memory, PayloadKind::Text) => Ok(()),
            (Destination::File(path), PayloadKind::File) => {
                if path.file_name().is_none() {
                    return Err(Error::InvalidDestination(format!(
                        "{} does not name a file",
                        path.display()
                    )));
                }
                Ok(())
            }
            (Destination::Memory, PayloadKind::File) => Err(Error::InvalidDestination(
                "a file payload needs a file path".into(),
            )),
            (Destination::File(path), PayloadKind::Text) => Err(Error::InvalidDestination(format!(
                "text payloads are received into memory, not {}",
                path.display()
            ))),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Destination::Memory => None,
            Destination::File(path) => Some(path),
        }
    }
}

/// Keep only the final path component of an offered name, so a peer can
/// never direct a write outside the download directory.
pub fn sanitize_name(name: &str, job_id: JobId) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim()
        .trim_start_matches('.');
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    if cleaned.is_empty() {
        format!("received-{}", job_id.short())
    } else {
        cleaned
    }
}

/// Partial output lives beside the final path until the hash verifies.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(PART_SUFFIX);
    path.with_file_name(name)
}

/// Receiver-side writer for one job.
pub enum Sink {
    Memory(Vec<u8>),
    File { path: PathBuf, part: PathBuf, file: File },
}

impl Sink {
    /// Fresh output for a new job. FILE output is preallocated to full size.
    pub async fn create(destination: &Destination, header: &TransferHeader) -> Result<Self, Error> {
        destination.check(header.kind)?;
        match destination {
            Destination::Memory => Ok(Sink::Memory(vec![0u8; header.total_size as usize])),
            Destination::File(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                let part = part_path(path);
                let file = OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .truncate(true)
                    .open(&part)
                    .await?;
                file.set_len(header.total_size).await?;
                Ok(Sink::File {
                    path: path.clone(),
                    part,
                    file,
                })
            }
        }
    }

    /// Reopen partial FILE output left by an earlier session. `None` when the
    /// partial file is gone or has the wrong size, so nothing in it can be
    /// trusted.
    pub async fn reopen(destination: &Destination, header: &TransferHeader) -> Result<Option<Self>, Error> {
        destination.check(header.kind)?;
        let Destination::File(path) = destination else {
            return Ok(None);
        };
        let part = part_path(path);
        match fs::metadata(&part).await {
            Ok(meta) if meta.len() == header.total_size => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let file = OpenOptions::new().read(true).write(true).open(&part).await?;
        Ok(Some(Sink::File {
            path: path.clone(),
            part,
            file,
        }))
    }

    pub async fn write_chunk(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        match self {
            Sink::Memory(buffer) => {
                let start = offset as usize;
                let slot = buffer
                    .get_mut(start..start + data.len())
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "chunk past end of payload"))?;
                slot.copy_from_slice(data);
                Ok(())
            }
            Sink::File { file, .. } => {
                file.seek(SeekFrom::Start(offset)).await?;
                file.write_all(data).await
            }
        }
    }

    /// Make written chunks durable before they are recorded as done.
    pub async fn sync(&mut self) -> io::Result<()> {
        match self {
            Sink::Memory(_) => Ok(()),
            Sink::File { file, .. } => {
                file.flush().await?;
                file.sync_data().await
            }
        }
    }

    /// Hash of everything written so far, recomputed from the output itself.
    pub async fn digest(&mut self) -> io::Result<[u8; 32]> {
        match self {
            Sink::Memory(buffer) => Ok(Sha256::digest(buffer).into()),
            Sink::File { file, .. } => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                let (_, hash) = hash_reader(file).await?;
                Ok(hash)
            }
        }
    }

    /// Publish verified output. Returns the text for TEXT payloads.
    pub async fn commit(self) -> io::Result<Option<String>> {
        match self {
            Sink::Memory(buffer) => Ok(Some(String::from_utf8_lossy(&buffer).into_owned())),
            Sink::File { path, part, mut file } => {
                file.sync_all().await?;
                drop(file);
                fs::rename(&part, &path).await?;
                debug!("Committed {}", path.display());
                Ok(None)
            }
        }
    }

    /// Drop the output. FILE partials are deleted.
    pub async fn discard(self) -> io::Result<()> {
        match self {
            Sink::Memory(_) => Ok(()),
            Sink::File { part, file, .. } => {
                drop(file);
                remove_if_exists(&part).await
            }
        }
    }
}

pub async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Stream a reader through SHA-256, returning (bytes read, digest).
pub async fn hash_reader<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(u64, [u8; 32])> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
    Ok((total, hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::job::JOB_ID_SIZE;

    fn job_id() -> JobId {
        JobId([0x42; JOB_ID_SIZE])
    }

    fn sample_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// A fixed permutation of 0..n that is far from sorted.
    fn scrambled(n: u32) -> Vec<u32> {
        let mut order: Vec<u32> = (0..n).collect();
        let mut state = 0x9E37_79B9u32;
        for i in (1..order.len()).rev() {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            order.swap(i, state as usize % (i + 1));
        }
        order
    }

    #[tokio::test]
    async fn test_text_describe_and_read() {
        let payload = Payload::text("hello");
        let header = payload.describe(job_id(), 2).await.unwrap();
        assert_eq!(header.kind, PayloadKind::Text);
        assert_eq!(header.total_size, 5);
        assert_eq!(header.total_chunks(), 3);
        let expected: [u8; 32] = Sha256::digest(b"hello").into();
        assert_eq!(header.content_hash, expected);

        let mut reader = payload.reader().await.unwrap();
        assert_eq!(reader.read_chunk(&header, 0).await.unwrap(), b"he");
        assert_eq!(reader.read_chunk(&header, 2).await.unwrap(), b"o");
    }

    #[tokio::test]
    async fn test_file_hash_is_streamed_and_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.bin");
        let data = sample_bytes(200_000);
        std::fs::write(&path, &data).unwrap();

        let header = Payload::File(path.clone()).describe(job_id(), 4096).await.unwrap();
        assert_eq!(header.total_size, 200_000);
        assert_eq!(header.name, "input.bin");
        let expected: [u8; 32] = Sha256::digest(&data).into();
        assert_eq!(header.content_hash, expected);
    }

    #[tokio::test]
    async fn test_describe_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        let result = Payload::File(dir.path().to_path_buf()).describe(job_id(), 1024).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_memory_reassembly_in_adversarial_order() {
        let data = sample_bytes(10_000);
        let payload = Payload::Text(data.clone());
        let header = payload.describe(job_id(), 333).await.unwrap();
        let mut reader = payload.reader().await.unwrap();

        let mut sink = Sink::create(&Destination::Memory, &header).await.unwrap();
        for index in scrambled(header.total_chunks()) {
            let chunk = reader.read_chunk(&header, index).await.unwrap();
            sink.write_chunk(header.offset(index), &chunk).await.unwrap();
        }
        assert_eq!(sink.digest().await.unwrap(), header.content_hash);
        let text = sink.commit().await.unwrap().unwrap();
        assert_eq!(text.as_bytes(), &data[..]);
    }

    #[tokio::test]
    async fn test_file_reassembly_in_adversarial_order() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let data = sample_bytes(50_001);
        std::fs::write(&source, &data).unwrap();

        let payload = Payload::File(source);
        let header = payload.describe(job_id(), 1000).await.unwrap();
        let mut reader = payload.reader().await.unwrap();

        let target = dir.path().join("out").join("copy.bin");
        let destination = Destination::File(target.clone());
        let mut sink = Sink::create(&destination, &header).await.unwrap();
        assert!(part_path(&target).exists());

        for index in scrambled(header.total_chunks()) {
            let chunk = reader.read_chunk(&header, index).await.unwrap();
            sink.write_chunk(header.offset(index), &chunk).await.unwrap();
        }
        assert_eq!(sink.digest().await.unwrap(), header.content_hash);
        assert!(sink.commit().await.unwrap().is_none());

        assert_eq!(std::fs::read(&target).unwrap(), data);
        assert!(!part_path(&target).exists());
    }

    #[tokio::test]
    async fn test_reopen_requires_matching_partial() {
        let dir = tempfile::tempdir().unwrap();
        let payload = Payload::Text(sample_bytes(100));
        let mut header = payload.describe(job_id(), 10).await.unwrap();
        header.kind = PayloadKind::File;
        let destination = Destination::File(dir.path().join("resume.bin"));

        assert!(Sink::reopen(&destination, &header).await.unwrap().is_none());

        let mut sink = Sink::create(&destination, &header).await.unwrap();
        sink.write_chunk(0, &[7u8; 10]).await.unwrap();
        sink.sync().await.unwrap();
        drop(sink);

        let mut reopened = Sink::reopen(&destination, &header).await.unwrap().unwrap();
        assert_ne!(reopened.digest().await.unwrap(), header.content_hash);
        reopened.discard().await.unwrap();
        assert!(!part_path(&dir.path().join("resume.bin")).exists());
    }

    #[test]
    fn test_destination_must_match_kind() {
        assert!(Destination::Memory.check(PayloadKind::Text).is_ok());
        assert!(Destination::Memory.check(PayloadKind::File).is_err());
        assert!(Destination::File("out.txt".into()).check(PayloadKind::Text).is_err());
        assert!(Destination::File("out.txt".into()).check(PayloadKind::File).is_ok());
        assert!(Destination::File("/".into()).check(PayloadKind::File).is_err());
    }

    #[test]
    fn test_sanitize_strips_paths() {
        assert_eq!(sanitize_name("report.pdf", job_id()), "report.pdf");
        assert_eq!(sanitize_name("../../etc/passwd", job_id()), "passwd");
        assert_eq!(sanitize_name("C:\\Users\\x\\notes.txt", job_id()), "notes.txt");
        assert_eq!(sanitize_name(".hidden", job_id()), "hidden");
        assert_eq!(sanitize_name("..", job_id()), "received-42424242");
        assert_eq!(sanitize_name("", job_id()), "received-42424242");
    }

    #[test]
    fn test_default_destination() {
        let header = TransferHeader {
            job_id: job_id(),
            kind: PayloadKind::File,
            total_size: 1,
            content_hash: [0; 32],
            chunk_size: 1,
            name: "../photo.jpg".into(),
        };
        assert_eq!(
            Destination::default_for(&header, Path::new("uploads")),
            Destination::File(PathBuf::from("uploads/photo.jpg"))
        );
    }
}
