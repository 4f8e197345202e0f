use std::{
    fmt,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use tessera_core::TokenSize;
use tracing::{debug, info, warn};

use crate::error::{config_error, NanosetError};

/// Magic number for modded-nanogpt binary format: 20240520
const MODDED_NANOGPT_MAGIC: u32 = 20240520;
/// Header size for modded-nanogpt format
const MODDED_NANOGPT_HEADER_SIZE: usize = 1024;

/// Magic header of a Megatron `.idx` sidecar.
const MEGATRON_INDEX_MAGIC: &[u8; 9] = b"MMIDIDX\x00\x00";
const MEGATRON_INDEX_VERSION: u64 = 1;
/// magic + version + dtype + sequence count + document count
const MEGATRON_INDEX_HEADER_SIZE: usize = 9 + 8 + 1 + 8 + 8;

/// Detected binary data format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    /// Raw binary tokens (no header)
    Raw,
    /// modded-nanogpt format with 1024-byte header
    ModdedNanogpt { version: u32, token_count: u32 },
}

impl DataFormat {
    /// Detect the format from the first bytes of a file
    pub fn detect(data: &[u8]) -> Self {
        if data.len() >= 12 {
            let word = |at: usize| {
                u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
            };
            if word(0) == MODDED_NANOGPT_MAGIC {
                return DataFormat::ModdedNanogpt {
                    version: word(4),
                    token_count: word(8),
                };
            }
        }
        DataFormat::Raw
    }

    /// Byte offset where token data starts
    pub fn header_size(&self) -> usize {
        match self {
            DataFormat::Raw => 0,
            DataFormat::ModdedNanogpt { .. } => MODDED_NANOGPT_HEADER_SIZE,
        }
    }
}

/// Document metadata read from a Megatron `.idx` file next to the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSidecar {
    pub token_size: TokenSize,
    pub num_documents: u64,
    pub num_tokens: u64,
}

impl IndexSidecar {
    fn dtype_code(token_size: TokenSize) -> u8 {
        match token_size {
            TokenSize::TwoBytes => 8,
            TokenSize::FourBytes => 4,
        }
    }

    fn parse(path: &Path, bytes: &[u8]) -> Result<Self, NanosetError> {
        if bytes.len() < MEGATRON_INDEX_HEADER_SIZE || &bytes[..9] != MEGATRON_INDEX_MAGIC {
            return Err(config_error!("{} is not a Megatron index file", path.display()));
        }
        let u64_at = |at: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(word)
        };

        let version = u64_at(9);
        if version != MEGATRON_INDEX_VERSION {
            return Err(config_error!(
                "{} has index version {version}, expected {MEGATRON_INDEX_VERSION}",
                path.display()
            ));
        }
        let token_size = match bytes[17] {
            8 => TokenSize::TwoBytes,
            4 => TokenSize::FourBytes,
            dtype => {
                return Err(config_error!(
                    "{} uses unsupported dtype code {dtype}",
                    path.display()
                ))
            }
        };
        let num_sequences = u64_at(18);
        // the document index carries a trailing sentinel
        let num_documents = u64_at(26).saturating_sub(1);

        let truncated = || config_error!("{} is truncated", path.display());
        let sizes_end = usize::try_from(num_sequences)
            .ok()
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(MEGATRON_INDEX_HEADER_SIZE))
            .ok_or_else(truncated)?;
        let sizes = bytes
            .get(MEGATRON_INDEX_HEADER_SIZE..sizes_end)
            .ok_or_else(truncated)?;
        let num_tokens = sizes
            .chunks_exact(4)
            .map(|size| i32::from_le_bytes([size[0], size[1], size[2], size[3]]).max(0) as u64)
            .sum();

        Ok(Self {
            token_size,
            num_documents,
            num_tokens,
        })
    }
}

fn is_truthy_env_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes")
}

type ShardBytes = Box<dyn AsRef<[u8]> + Send + Sync>;

fn mmap_file(path: &Path) -> Result<ShardBytes, NanosetError> {
    let file = File::open(path).map_err(|e| NanosetError::io(path, e))?;

    // try to mmap first, only falling back to read if allowed
    match unsafe { memmap2::MmapOptions::new().map(&file) } {
        Ok(mmap) => Ok(Box::new(mmap)),
        Err(e)
            if e.raw_os_error() == Some(22)
                && std::env::var("ALLOW_FAIL_MMAP")
                    .map(|v| is_truthy_env_bool(&v))
                    .unwrap_or(false) =>
        {
            warn!(path = %path.display(), "mmap failed, falling back to file read");
            let data = std::fs::read(path).map_err(|e| NanosetError::io(path, e))?;
            Ok(Box::new(data))
        }
        Err(e) => Err(NanosetError::io(path, e)),
    }
}

/// One read-only, memory-mapped token shard.
pub struct TokenShard {
    path: PathBuf,
    data: ShardBytes,
    format: DataFormat,
    token_size: TokenSize,
    num_tokens: usize,
    sidecar: Option<IndexSidecar>,
}

impl fmt::Debug for TokenShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenShard")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("token_size", &self.token_size)
            .field("num_tokens", &self.num_tokens)
            .field("sidecar", &self.sidecar)
            .finish()
    }
}

impl TokenShard {
    pub fn open(path: impl AsRef<Path>, token_size: TokenSize) -> Result<Self, NanosetError> {
        let path = path.as_ref();
        let data = mmap_file(path)?;
        let bytes = data.as_ref().as_ref();
        let format = DataFormat::detect(bytes);
        let token_width = usize::from(token_size);
        let payload_bytes = bytes.len().saturating_sub(format.header_size());

        let num_tokens = match format {
            DataFormat::Raw => {
                debug!(path = %path.display(), "Raw binary format (no header)");
                if payload_bytes % token_width != 0 {
                    warn!(
                        path = %path.display(),
                        trailing_bytes = payload_bytes % token_width,
                        "Shard length is not a whole number of tokens; ignoring the tail"
                    );
                }
                payload_bytes / token_width
            }
            DataFormat::ModdedNanogpt {
                version,
                token_count,
            } => {
                debug!(
                    path = %path.display(),
                    version, token_count, "modded-nanogpt format"
                );
                let token_count = token_count as usize;
                if token_count * token_width > payload_bytes {
                    return Err(config_error!(
                        "{} declares {token_count} tokens but only holds {}",
                        path.display(),
                        payload_bytes / token_width
                    ));
                }
                token_count
            }
        };

        let sidecar_path = path.with_extension("idx");
        let sidecar = if sidecar_path.is_file() && sidecar_path != path {
            let bytes =
                std::fs::read(&sidecar_path).map_err(|e| NanosetError::io(&sidecar_path, e))?;
            let sidecar = IndexSidecar::parse(&sidecar_path, &bytes)?;
            if sidecar.token_size != token_size {
                return Err(config_error!(
                    "{} describes {:?} tokens but the shard is read as {:?}",
                    sidecar_path.display(),
                    sidecar.token_size,
                    token_size
                ));
            }
            if sidecar.num_tokens > num_tokens as u64 {
                return Err(config_error!(
                    "{} indexes {} tokens but {} only holds {num_tokens}",
                    sidecar_path.display(),
                    sidecar.num_tokens,
                    path.display()
                ));
            }
            Some(sidecar)
        } else {
            None
        };

        Ok(Self {
            path: path.to_path_buf(),
            data,
            format,
            token_size,
            num_tokens,
            sidecar,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    pub fn token_size(&self) -> TokenSize {
        self.token_size
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn num_documents(&self) -> Option<u64> {
        self.sidecar.map(|sidecar| sidecar.num_documents)
    }

    /// Samples of `sequence_length + 1` tokens, consecutive samples sharing one token.
    pub fn num_samples(&self, sequence_length: usize) -> usize {
        if sequence_length == 0 {
            return 0;
        }
        self.num_tokens.saturating_sub(1) / sequence_length
    }

    pub fn read_sample(
        &self,
        sample: usize,
        sequence_length: usize,
    ) -> Result<Vec<u32>, NanosetError> {
        let len = self.num_samples(sequence_length);
        if sample >= len {
            return Err(NanosetError::Index { index: sample, len });
        }

        let width = usize::from(self.token_size);
        let start = self.format.header_size() + sample * sequence_length * width;
        let end = start + (sequence_length + 1) * width;
        let bytes = &self.data.as_ref().as_ref()[start..end];
        Ok(bytes
            .chunks_exact(width)
            .map(|token| self.token_size.decode(token))
            .collect())
    }
}

/// Writes `tokens` as a raw little-endian shard.
pub fn write_token_shard(
    path: impl AsRef<Path>,
    tokens: &[u32],
    token_size: TokenSize,
) -> Result<(), NanosetError> {
    let path = path.as_ref();
    if let Some(token) = tokens.iter().find(|&&token| token > token_size.max_token()) {
        return Err(config_error!(
            "token {token} does not fit in {} bytes",
            usize::from(token_size)
        ));
    }

    let mut bytes = Vec::with_capacity(tokens.len() * usize::from(token_size));
    for &token in tokens {
        token_size.encode(token, &mut bytes);
    }
    std::fs::write(path, bytes).map_err(|e| NanosetError::io(path, e))?;
    info!(path = %path.display(), num_tokens = tokens.len(), "Wrote token shard");
    Ok(())
}

/// Writes a Megatron `.idx` sidecar for a shard made of `document_lengths` documents.
pub fn write_index_sidecar(
    shard_path: impl AsRef<Path>,
    document_lengths: &[u32],
    token_size: TokenSize,
) -> Result<PathBuf, NanosetError> {
    let idx_path = shard_path.as_ref().with_extension("idx");
    let mut bytes = Vec::with_capacity(MEGATRON_INDEX_HEADER_SIZE + document_lengths.len() * 20);
    bytes.extend_from_slice(MEGATRON_INDEX_MAGIC);
    bytes.extend_from_slice(&MEGATRON_INDEX_VERSION.to_le_bytes());
    bytes.push(IndexSidecar::dtype_code(token_size));
    bytes.extend_from_slice(&(document_lengths.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&(document_lengths.len() as u64 + 1).to_le_bytes());
    for &len in document_lengths {
        bytes.extend_from_slice(&(len as i32).to_le_bytes());
    }
    let mut pointer = 0i64;
    for &len in document_lengths {
        bytes.extend_from_slice(&pointer.to_le_bytes());
        pointer += len as i64 * usize::from(token_size) as i64;
    }
    for doc in 0..=document_lengths.len() {
        bytes.extend_from_slice(&(doc as i64).to_le_bytes());
    }

    let mut file = File::create(&idx_path).map_err(|e| NanosetError::io(&idx_path, e))?;
    file.write_all(&bytes)
        .map_err(|e| NanosetError::io(&idx_path, e))?;
    Ok(idx_path)
}
