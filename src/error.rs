use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("invalid checksum")]
    InvalidChecksum,

    #[error("invalid B-tree: {0}")]
    InvalidBTree(String),

    #[error("B-tree descent exceeded maximum depth")]
    DepthOverflow,

    #[error("object xid {oid_xid} is newer than the selected checkpoint xid {checkpoint_xid}")]
    FutureXid { oid_xid: u64, checkpoint_xid: u64 },

    #[error("no valid checkpoint found in descriptor ring")]
    NoValidCheckpoint,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("not a regular file: {0}")]
    NotAFile(String),

    #[error("symlink resolution exceeded loop limit")]
    PathLoop,

    #[error("corrupted data: {0}")]
    CorruptedData(String),

    #[error("corrupted compressed stream: {0}")]
    CorruptCompressedStream(String),

    #[error("truncated input: needed {needed} bits, {available} available")]
    TruncatedInput { needed: u32, available: u32 },

    #[error("no volume found in container")]
    NoVolume,

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("volume is locked (encrypted, no key available)")]
    Locked,

    #[error("incorrect passphrase")]
    BadPassphrase,

    #[error("unsupported key derivation function")]
    UnsupportedKdf,

    #[error("ciphertext is not a multiple of the 512-byte sector size")]
    MisalignedSector,

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("unsupported compression algorithm: {0}")]
    UnsupportedCompression(u8),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, ApfsError>;
