use thiserror::Error;

/// Payload could not be turned into a pixel buffer.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported or malformed image: {0}")]
    Image(#[from] image::ImageError),

    #[error("reading {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("payload is {bytes} bytes, over the {limit} byte limit")]
    TooLarge { bytes: u64, limit: u64 },

    #[error("empty payload")]
    Empty,
}

/// Failure reported by (or while talking to) the text-detection engine.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("failed to start detection worker: {0}")]
    Spawn(String),

    #[error("detection worker io: {0}")]
    Io(#[from] std::io::Error),

    #[error("detection worker protocol: {0}")]
    Protocol(String),

    #[error("detection engine error: {0}")]
    Engine(String),

    #[error("detection exceeded {seconds}s timeout")]
    Timeout { seconds: u64 },

    #[error("detection worker exited: {0}")]
    Crashed(String),

    #[error("detection worker failed to start earlier: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("blur kernel size must be odd and >= 3, got {0}")]
    InvalidKernel(u32),

    #[error("box stroke width must be >= 1")]
    InvalidStroke,
}

#[derive(Debug, Error)]
#[error("encoding {format}: {source}")]
pub struct EncodeError {
    pub format: String,
    #[source]
    pub source: image::ImageError,
}

/// Anything that can go wrong for a single batch item. Never escapes the
/// item processor; it is rendered into the item's error description.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("panic during processing: {0}")]
    Panicked(String),

    #[error("batch cancelled before this item started")]
    Cancelled,
}

impl ItemError {
    pub fn kind(&self) -> &'static str {
        match self {
            ItemError::Decode(_) => "decode",
            ItemError::Detection(_) => "detection",
            ItemError::Transform(_) => "transform",
            ItemError::Encode(_) => "encode",
            ItemError::Panicked(_) => "panic",
            ItemError::Cancelled => "cancelled",
        }
    }
}

/// Packaging preconditions and sink failures. These do propagate.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("batch is empty; nothing to package")]
    EmptyBatch,

    #[error("no decodable images to assemble into a document")]
    NoImages,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("pdf: {0}")]
    Pdf(#[from] lopdf::Error),
}
