//! NMD binary format implementation.
//!
//! The format uses a fixed-size header with magic bytes, version, and flags,
//! followed by a JSON-serialized module payload, terminated by a SHA-256
//! content hash for integrity verification.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

use nativize_model::Module;

/// Magic bytes identifying a module image: "NMD\0"
pub const MAGIC: [u8; 4] = [0x4E, 0x4D, 0x44, 0x00];

/// Size of the fixed header (magic + version + flags + counts + payload length).
/// 4 (magic) + 3 (version) + 1 (flags) + 8*4 (counts + payload_len) = 40 bytes
const HEADER_SIZE: usize = 40;

/// Size of the trailing content hash.
const HASH_SIZE: usize = 32;

/// Errors that can occur during image file operations.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid magic bytes: expected NMD\\0")]
    InvalidMagic,

    #[error("unsupported format version {major}.{minor}.{patch}")]
    UnsupportedVersion { major: u8, minor: u8, patch: u8 },

    #[error("content hash mismatch: file is corrupted")]
    HashMismatch,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("file too small to be a valid module image")]
    FileTooSmall,
}

/// Image format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl ImageVersion {
    /// The current format version.
    pub const CURRENT: ImageVersion = ImageVersion {
        major: 0,
        minor: 1,
        patch: 0,
    };

    /// Same major version and a minor version no newer than ours.
    pub fn is_compatible(&self) -> bool {
        self.major == Self::CURRENT.major && self.minor <= Self::CURRENT.minor
    }
}

impl std::fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Image format flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFlags {
    bits: u8,
}

impl ImageFlags {
    /// No flags set.
    pub const NONE: ImageFlags = ImageFlags { bits: 0 };

    /// Module still declares native-import stubs.
    pub const HAS_IMPORT_STUBS: u8 = 0x01;

    /// Payload embeds definitions from referenced assemblies.
    pub const HAS_REFERENCES: u8 = 0x02;

    /// Module has been through the import rewriter.
    pub const REWRITTEN: u8 = 0x04;

    pub fn new(bits: u8) -> Self {
        Self { bits }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.bits & flag != 0
    }

    pub fn set(&mut self, flag: u8) {
        self.bits |= flag;
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }
}

/// Decoded fixed header, readable without parsing the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub version: ImageVersion,
    pub flags: ImageFlags,
    pub type_count: u64,
    pub method_count: u64,
    pub import_stub_count: u64,
    pub payload_len: u64,
}

impl ImageHeader {
    /// Decode and validate the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, ImageError> {
        if data.len() < HEADER_SIZE + HASH_SIZE {
            return Err(ImageError::FileTooSmall);
        }

        if data[0..4] != MAGIC {
            return Err(ImageError::InvalidMagic);
        }

        let version = ImageVersion {
            major: data[4],
            minor: data[5],
            patch: data[6],
        };
        if !version.is_compatible() {
            return Err(ImageError::UnsupportedVersion {
                major: version.major,
                minor: version.minor,
                patch: version.patch,
            });
        }

        Ok(Self {
            version,
            flags: ImageFlags::new(data[7]),
            type_count: read_u64(data, 8)?,
            method_count: read_u64(data, 16)?,
            import_stub_count: read_u64(data, 24)?,
            payload_len: read_u64(data, 32)?,
        })
    }
}

fn read_u64(data: &[u8], at: usize) -> Result<u64, ImageError> {
    let bytes: [u8; 8] = data
        .get(at..at + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or(ImageError::FileTooSmall)?;
    Ok(u64::from_le_bytes(bytes))
}

/// A module image: header metadata + module.
#[derive(Debug)]
pub struct ImageFile {
    /// Format version.
    pub version: ImageVersion,
    /// Format flags.
    pub flags: ImageFlags,
    /// The module data.
    pub module: Module,
}

impl ImageFile {
    /// Create a new image wrapping the given module.
    pub fn new(module: Module) -> Self {
        let mut flags = ImageFlags::NONE;
        if module.import_stub_count() > 0 {
            flags.set(ImageFlags::HAS_IMPORT_STUBS);
        }
        if !module.references.is_empty() {
            flags.set(ImageFlags::HAS_REFERENCES);
        }
        Self {
            version: ImageVersion::CURRENT,
            flags,
            module,
        }
    }

    /// Serialize to a writer in NMD binary format.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), ImageError> {
        let payload = serde_json::to_vec(&self.module)
            .map_err(|e| ImageError::Serialization(e.to_string()))?;

        let type_count = self.module.types.len() as u64;
        let method_count = self.module.method_count() as u64;
        let stub_count = self.module.import_stub_count() as u64;
        let payload_len = payload.len() as u64;

        // Hash covers header + payload
        let mut hasher = Sha256::new();

        writer.write_all(&MAGIC)?;
        hasher.update(MAGIC);

        let version_bytes = [self.version.major, self.version.minor, self.version.patch];
        writer.write_all(&version_bytes)?;
        hasher.update(version_bytes);

        writer.write_all(&[self.flags.bits()])?;
        hasher.update([self.flags.bits()]);

        for val in [type_count, method_count, stub_count, payload_len] {
            let bytes = val.to_le_bytes();
            writer.write_all(&bytes)?;
            hasher.update(bytes);
        }

        writer.write_all(&payload)?;
        hasher.update(&payload);

        let hash: [u8; 32] = hasher.finalize().into();
        writer.write_all(&hash)?;

        Ok(())
    }

    /// Serialize to a byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ImageError> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Deserialize from a reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, ImageError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::from_bytes(&data)
    }

    /// Deserialize from a byte slice.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ImageError> {
        let header = ImageHeader::parse(data)?;
        let payload_len =
            usize::try_from(header.payload_len).map_err(|_| ImageError::FileTooSmall)?;

        let payload_end = HEADER_SIZE
            .checked_add(payload_len)
            .ok_or(ImageError::FileTooSmall)?;
        if data.len() < payload_end + HASH_SIZE {
            return Err(ImageError::FileTooSmall);
        }

        let stored_hash = &data[payload_end..payload_end + HASH_SIZE];
        let mut hasher = Sha256::new();
        hasher.update(&data[..payload_end]);
        let computed_hash: [u8; 32] = hasher.finalize().into();
        if computed_hash != stored_hash {
            return Err(ImageError::HashMismatch);
        }

        let payload = &data[HEADER_SIZE..payload_end];
        let module: Module = serde_json::from_slice(payload)
            .map_err(|e| ImageError::Serialization(e.to_string()))?;

        Ok(Self {
            version: header.version,
            flags: header.flags,
            module,
        })
    }

    /// Read an image file from disk.
    pub fn load(path: &Path) -> Result<Self, ImageError> {
        let data = fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Write the image to disk, replacing any existing file.
    pub fn save(&self, path: &Path) -> Result<(), ImageError> {
        let bytes = self.to_bytes()?;
        fs::write(path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nativize_model::builder::{method, param, ModuleBuilder};
    use nativize_model::TypeRef;

    fn sample_module() -> Module {
        ModuleBuilder::new("sample")
            .class("App.Native", |t| {
                t.method(
                    method("Add", TypeRef::i32())
                        .with_params(vec![param("a", TypeRef::i32()), param("b", TypeRef::i32())])
                        .import("m"),
                )
                .method(method("Main", TypeRef::void()))
            })
            .reference_struct("System.Drawing.Point", |t| {
                t.field("X", TypeRef::i32()).field("Y", TypeRef::i32())
            })
            .build()
    }

    #[test]
    fn round_trip() {
        let module = sample_module();
        let image = ImageFile::new(module.clone());

        let bytes = image.to_bytes().unwrap();
        let loaded = ImageFile::from_bytes(&bytes).unwrap();

        assert_eq!(loaded.version, ImageVersion::CURRENT);
        assert_eq!(loaded.module, module);
        assert!(loaded.flags.has(ImageFlags::HAS_IMPORT_STUBS));
        assert!(loaded.flags.has(ImageFlags::HAS_REFERENCES));
        assert!(!loaded.flags.has(ImageFlags::REWRITTEN));
    }

    #[test]
    fn header_counts() {
        let image = ImageFile::new(sample_module());
        let bytes = image.to_bytes().unwrap();
        let header = ImageHeader::parse(&bytes).unwrap();
        assert_eq!(header.type_count, 1);
        assert_eq!(header.method_count, 2);
        assert_eq!(header.import_stub_count, 1);
        assert_eq!(
            header.payload_len as usize,
            bytes.len() - HEADER_SIZE - HASH_SIZE
        );
    }

    #[test]
    fn invalid_magic_rejected() {
        let image = ImageFile::new(Module::new("empty"));
        let mut bytes = image.to_bytes().unwrap();
        bytes[0] = 0xFF;
        assert!(matches!(
            ImageFile::from_bytes(&bytes),
            Err(ImageError::InvalidMagic)
        ));
    }

    #[test]
    fn newer_major_version_rejected() {
        let image = ImageFile::new(Module::new("empty"));
        let mut bytes = image.to_bytes().unwrap();
        bytes[4] = 9;
        assert!(matches!(
            ImageFile::from_bytes(&bytes),
            Err(ImageError::UnsupportedVersion { major: 9, .. })
        ));
    }

    #[test]
    fn corrupted_payload_rejected() {
        let image = ImageFile::new(sample_module());
        let mut bytes = image.to_bytes().unwrap();
        let mid = HEADER_SIZE + 10;
        bytes[mid] ^= 0xFF;
        assert!(matches!(
            ImageFile::from_bytes(&bytes),
            Err(ImageError::HashMismatch)
        ));
    }

    #[test]
    fn truncated_file_rejected() {
        assert!(matches!(
            ImageFile::from_bytes(&[0x4E, 0x4D, 0x44, 0x00]),
            Err(ImageError::FileTooSmall)
        ));

        let image = ImageFile::new(sample_module());
        let bytes = image.to_bytes().unwrap();
        assert!(matches!(
            ImageFile::from_bytes(&bytes[..bytes.len() - 1]),
            Err(ImageError::FileTooSmall)
        ));
    }

    #[test]
    fn flags_operations() {
        let mut flags = ImageFlags::NONE;
        assert!(!flags.has(ImageFlags::REWRITTEN));
        flags.set(ImageFlags::REWRITTEN);
        assert!(flags.has(ImageFlags::REWRITTEN));
        assert!(!flags.has(ImageFlags::HAS_IMPORT_STUBS));
        assert_eq!(flags.bits(), 0x04);
    }

    #[test]
    fn save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.nmd");
        let mut image = ImageFile::new(sample_module());
        image.flags.set(ImageFlags::REWRITTEN);
        image.save(&path).unwrap();

        let loaded = ImageFile::load(&path).unwrap();
        assert_eq!(loaded.module.name, "sample");
        assert!(loaded.flags.has(ImageFlags::REWRITTEN));
    }

    #[test]
    fn write_and_read_via_io() {
        let image = ImageFile::new(sample_module());
        let mut buf = Vec::new();
        image.write_to(&mut buf).unwrap();
        let loaded = ImageFile::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded.module.method_count(), 2);
    }
}
