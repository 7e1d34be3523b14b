//! Streaming AES-256-GCM encryption.
//!
//! Layout of an encrypted stream:
//!
//! ```text
//! magic "BKR1" | version u8 | m_cost u32 | t_cost u32 | p_cost u32 | salt [16] | nonce prefix [7]
//! chunk 0 .. chunk n-1   (CHUNK_SIZE plaintext + 16 byte tag each)
//! last chunk             (0..=CHUNK_SIZE plaintext + 16 byte tag)
//! ```

use super::{derive_key, KdfParams, Passphrase};
use crate::archive::{ArchiveError, Encryptor, SealedWrite};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::aead::{KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use std::io::{self, Read, Write};

const MAGIC: &[u8; 4] = b"BKR1";
const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
/// 96-bit GCM nonce minus the 5 bytes STREAM uses for counter and flag
const NONCE_PREFIX_LEN: usize = 7;
const HEADER_LEN: usize = 4 + 1 + 4 * 3 + SALT_LEN + NONCE_PREFIX_LEN;
const TAG_LEN: usize = 16;

/// Plaintext bytes per chunk
pub const CHUNK_SIZE: usize = 64 * 1024;
const SEALED_CHUNK_SIZE: usize = CHUNK_SIZE + TAG_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamHeader {
    params: KdfParams,
    salt: [u8; SALT_LEN],
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

impl StreamHeader {
    fn generate(params: KdfParams) -> Self {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce_prefix);
        Self {
            params,
            salt,
            nonce_prefix,
        }
    }

    fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(MAGIC);
        out[4] = FORMAT_VERSION;
        out[5..9].copy_from_slice(&self.params.memory_kib.to_be_bytes());
        out[9..13].copy_from_slice(&self.params.iterations.to_be_bytes());
        out[13..17].copy_from_slice(&self.params.lanes.to_be_bytes());
        out[17..17 + SALT_LEN].copy_from_slice(&self.salt);
        out[17 + SALT_LEN..].copy_from_slice(&self.nonce_prefix);
        out
    }

    fn read_from(reader: &mut dyn Read) -> Result<Self, ArchiveError> {
        let mut raw = [0u8; HEADER_LEN];
        reader.read_exact(&mut raw).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                ArchiveError::Format("stream too short for encryption header".into())
            }
            _ => ArchiveError::Io(e),
        })?;

        if &raw[..4] != MAGIC {
            return Err(ArchiveError::Format("not an encrypted backup stream".into()));
        }
        if raw[4] != FORMAT_VERSION {
            return Err(ArchiveError::Format(format!(
                "unsupported encryption format version {}",
                raw[4]
            )));
        }

        let word = |at: usize| u32::from_be_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&raw[17..17 + SALT_LEN]);
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        nonce_prefix.copy_from_slice(&raw[17 + SALT_LEN..]);

        let params = KdfParams {
            memory_kib: word(5),
            iterations: word(9),
            lanes: word(13),
        };
        params.check_bounds().map_err(|reason| {
            ArchiveError::Format(format!("implausible key parameters: {}", reason))
        })?;

        Ok(Self {
            params,
            salt,
            nonce_prefix,
        })
    }

    fn cipher(&self, passphrase: &Passphrase) -> Result<Aes256Gcm, ArchiveError> {
        let key = derive_key(passphrase, &self.salt, &self.params)?;
        Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| ArchiveError::Encryption(format!("Failed to create cipher: {}", e)))
    }
}

/// AES-256-GCM STREAM encryptor keyed by Argon2id.
#[derive(Debug, Clone, Default)]
pub struct AesGcmEncryptor {
    params: KdfParams,
}

impl AesGcmEncryptor {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }
}

impl Encryptor for AesGcmEncryptor {
    fn encrypt_to(
        &self,
        mut sink: Box<dyn SealedWrite>,
        passphrase: &Passphrase,
    ) -> Result<Box<dyn SealedWrite>, ArchiveError> {
        let header = StreamHeader::generate(self.params);
        let cipher = header.cipher(passphrase)?;
        sink.write_all(&header.to_bytes())?;

        let nonce = GenericArray::from_slice(&header.nonce_prefix);
        let stream = EncryptorBE32::from_aead(cipher, nonce);
        Ok(Box::new(EncryptingWriter {
            inner: sink,
            stream: Some(stream),
            buffer: Vec::with_capacity(CHUNK_SIZE * 2),
        }))
    }

    fn decrypt_from(
        &self,
        mut source: Box<dyn Read + Send>,
        passphrase: &Passphrase,
    ) -> Result<Box<dyn Read + Send>, ArchiveError> {
        let header = StreamHeader::read_from(&mut source)?;
        let cipher = header.cipher(passphrase)?;

        let nonce = GenericArray::from_slice(&header.nonce_prefix);
        let stream = DecryptorBE32::from_aead(cipher, nonce);
        Ok(Box::new(DecryptingReader {
            inner: source,
            stream: Some(stream),
            pending: Vec::with_capacity(SEALED_CHUNK_SIZE + 1),
            plain: Vec::new(),
            pos: 0,
        }))
    }
}

fn auth_failure() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        "archive authentication failed (wrong passphrase or corrupted data)",
    )
}

fn finished_stream() -> io::Error {
    io::Error::other("encryption stream already finished")
}

struct EncryptingWriter {
    inner: Box<dyn SealedWrite>,
    stream: Option<EncryptorBE32<Aes256Gcm>>,
    buffer: Vec<u8>,
}

impl EncryptingWriter {
    /// Seal every full chunk, always holding at least one byte back so the
    /// last chunk is never empty unless the whole stream is.
    fn seal_full_chunks(&mut self) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(finished_stream)?;
        while self.buffer.len() > CHUNK_SIZE {
            let rest = self.buffer.split_off(CHUNK_SIZE);
            let chunk = std::mem::replace(&mut self.buffer, rest);
            let sealed = stream
                .encrypt_next(chunk.as_slice())
                .map_err(|_| io::Error::other("chunk encryption failed"))?;
            self.inner.write_all(&sealed)?;
        }
        Ok(())
    }
}

impl Write for EncryptingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.seal_full_chunks()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl SealedWrite for EncryptingWriter {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut this = *self;
        let stream = this.stream.take().ok_or_else(finished_stream)?;
        let sealed = stream
            .encrypt_last(this.buffer.as_slice())
            .map_err(|_| io::Error::other("final chunk encryption failed"))?;
        this.inner.write_all(&sealed)?;
        this.inner.finish()
    }
}

struct DecryptingReader {
    inner: Box<dyn Read + Send>,
    stream: Option<DecryptorBE32<Aes256Gcm>>,
    /// Ciphertext read ahead of decryption
    pending: Vec<u8>,
    plain: Vec<u8>,
    pos: usize,
}

impl DecryptingReader {
    /// Read until one byte past a full sealed chunk is buffered, or EOF.
    fn fill_pending(&mut self) -> io::Result<()> {
        let want = SEALED_CHUNK_SIZE + 1;
        let mut filled = self.pending.len();
        self.pending.resize(want, 0);
        while filled < want {
            match self.inner.read(&mut self.pending[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.pending.truncate(filled);
                    return Err(e);
                }
            }
        }
        self.pending.truncate(filled);
        Ok(())
    }

    /// Decrypt the next chunk into `plain`. Returns false at end of stream.
    fn next_chunk(&mut self) -> io::Result<bool> {
        if self.stream.is_none() {
            return Ok(false);
        }
        self.fill_pending()?;

        self.plain = if self.pending.len() > SEALED_CHUNK_SIZE {
            let rest = self.pending.split_off(SEALED_CHUNK_SIZE);
            let chunk = std::mem::replace(&mut self.pending, rest);
            let stream = self.stream.as_mut().ok_or_else(finished_stream)?;
            stream
                .decrypt_next(chunk.as_slice())
                .map_err(|_| auth_failure())?
        } else {
            // Whatever remains is the last chunk; a truncated stream fails
            // here because its final chunk was sealed as non-last
            let stream = self.stream.take().ok_or_else(finished_stream)?;
            let chunk = std::mem::take(&mut self.pending);
            stream
                .decrypt_last(chunk.as_slice())
                .map_err(|_| auth_failure())?
        };
        self.pos = 0;
        Ok(true)
    }
}

impl Read for DecryptingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.plain.len() {
            if !self.next_chunk()? {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
