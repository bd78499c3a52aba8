//! Tagged, dictionary-aware compression for stored text payloads.
//!
//! Every compressed column starts with a one byte tag:
//!
//! | Tag | Layout | Meaning |
//! |-----|--------|---------|
//! | `T` | `[T][bytes]` | stored verbatim (input shorter than 100 bytes) |
//! | `Z` | `[Z][u32 BE len][zlib]` | deflate, no preset dictionary |
//! | `J` | `[J][u32 BE len][zlib]` | deflate, JSON dictionary |
//! | `P` | `[P][u32 BE len][zlib]` | deflate, profile image URL dictionary |
//!
//! The dictionaries are fixed. Changing a single byte of either one makes
//! every existing `J`/`P` blob undecodable.

use std::collections::BTreeSet;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, ValueRef};
use thiserror::Error;
use tracing::{error, trace};

/// Inputs shorter than this are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 100;

/// Tag byte + 4 byte big-endian original length.
const HEADER_LEN: usize = 5;

const RAW_TAG: u8 = b'T';

/// Refuse to allocate more than this for a single decoded value.
const MAX_INFLATED_LEN: usize = 256 * 1024 * 1024;

// Both dictionaries keep the trailing NUL so that blobs written by older
// clients still inflate.
const JSON_DICTIONARY: &[u8] = concat!(
    "<a href=\"http://retweet_countsourcetextentitiesindiceshashtagsurlsdisplayexpandedjpgpng",
    "user_mentionsmediaidhttptweetusercreatedfavoritedscreen_namein_reply_to_user_idprofile",
    "protectedfollowdescriptionfriends",
    "typesizesthe[{\",\":\"}]",
    "\0"
)
.as_bytes();

const PROFILE_IMAGE_DICTIONARY: &[u8] =
    "http://https://si0.twimg.com/profile_images/imagesmallnormal.png.jpg.jpeg.gif\0".as_bytes();

/// Errors produced while encoding or decoding a tagged blob.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The blob is not a valid tagged value.
    #[error("corrupt blob: {0}")]
    Corrupt(String),

    /// Input does not fit the 32-bit length header.
    #[error("value of {0} bytes is too large to compress")]
    TooLarge(usize),

    /// The deflate engine rejected the input.
    #[error("deflate failed: {0}")]
    Deflate(String),
}

impl CodecError {
    fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt(reason.into())
    }
}

/// Preset dictionary selection for [`compress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dictionary {
    /// Plain deflate (`Z`).
    None,
    /// JSON-shaped text: tweet and user documents (`J`).
    Json,
    /// Profile image URLs (`P`).
    ProfileImage,
}

/// Tag → dictionary lookup table.
const DICTIONARIES: [(u8, Dictionary, Option<&[u8]>); 3] = [
    (b'Z', Dictionary::None, None),
    (b'J', Dictionary::Json, Some(JSON_DICTIONARY)),
    (b'P', Dictionary::ProfileImage, Some(PROFILE_IMAGE_DICTIONARY)),
];

impl Dictionary {
    /// Every dictionary the codec understands.
    pub const ALL: [Self; 3] = [Self::None, Self::Json, Self::ProfileImage];

    /// The tag byte written in front of blobs compressed with this dictionary.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::None => DICTIONARIES[0].0,
            Self::Json => DICTIONARIES[1].0,
            Self::ProfileImage => DICTIONARIES[2].0,
        }
    }

    /// Look up the dictionary for a compressed tag.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        DICTIONARIES
            .iter()
            .find(|(t, _, _)| *t == tag)
            .map(|(_, dict, _)| *dict)
    }

    /// Preset dictionary bytes, if any.
    #[must_use]
    pub fn bytes(self) -> Option<&'static [u8]> {
        DICTIONARIES
            .iter()
            .find(|(_, dict, _)| *dict == self)
            .and_then(|(_, _, bytes)| *bytes)
    }
}

/// Output of [`compress`].
///
/// Binds as a BLOB when compressed and as TEXT otherwise, so short values
/// remain usable by the store's own string functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedBlob {
    bytes: Vec<u8>,
    compressed: bool,
    blob_only: bool,
}

impl CompressedBlob {
    /// The tagged bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into the tagged bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Whether the payload went through deflate.
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// The tag byte.
    #[must_use]
    pub fn tag(&self) -> u8 {
        self.bytes[0]
    }

    /// Always bind as a BLOB, even when stored raw.
    #[must_use]
    pub const fn blob_only(mut self) -> Self {
        self.blob_only = true;
        self
    }
}

impl ToSql for CompressedBlob {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = if self.compressed || self.blob_only {
            ValueRef::Blob(&self.bytes)
        } else {
            ValueRef::Text(&self.bytes)
        };
        Ok(ToSqlOutput::Borrowed(value))
    }
}

/// Compress `input`, tagging it with `dictionary`.
///
/// Inputs below [`COMPRESSION_THRESHOLD`] are stored raw under the `T` tag
/// whatever dictionary was requested.
///
/// # Errors
///
/// Returns [`CodecError::TooLarge`] if the input exceeds `u32::MAX` bytes and
/// [`CodecError::Deflate`] if zlib rejects the stream.
pub fn compress(input: &[u8], dictionary: Dictionary) -> Result<CompressedBlob, CodecError> {
    if input.len() < COMPRESSION_THRESHOLD {
        let mut bytes = Vec::with_capacity(input.len() + 1);
        bytes.push(RAW_TAG);
        bytes.extend_from_slice(input);
        return Ok(CompressedBlob {
            bytes,
            compressed: false,
            blob_only: false,
        });
    }

    let original_len = u32::try_from(input.len()).map_err(|_| CodecError::TooLarge(input.len()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + deflate_bound(input.len()));
    out.push(dictionary.tag());
    out.extend_from_slice(&original_len.to_be_bytes());

    let mut encoder = Compress::new(Compression::best(), true);
    if let Some(dict) = dictionary.bytes() {
        encoder
            .set_dictionary(dict)
            .map_err(|e| CodecError::Deflate(e.to_string()))?;
    }

    loop {
        let consumed = stream_offset(encoder.total_in(), input.len());
        match encoder.compress_vec(&input[consumed..], &mut out, FlushCompress::Finish) {
            Ok(Status::StreamEnd) => break,
            Ok(Status::Ok | Status::BufError) => out.reserve(1024),
            Err(e) => return Err(CodecError::Deflate(e.to_string())),
        }
    }

    trace!(
        tag = %char::from(dictionary.tag()),
        input = input.len(),
        output = out.len(),
        "compressed value"
    );

    Ok(CompressedBlob {
        bytes: out,
        compressed: true,
        blob_only: false,
    })
}

/// Decode a tagged blob.
///
/// An empty input means "no data" and yields `Ok(None)`.
///
/// # Errors
///
/// Returns [`CodecError::Corrupt`] for an unknown tag, a truncated header or
/// stream, a stream that needs a dictionary the tag does not provide, or a
/// decoded length different from the header. No partial output is returned.
pub fn decompress(input: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
    let Some((&tag, rest)) = input.split_first() else {
        return Ok(None);
    };

    if tag == RAW_TAG {
        return Ok(Some(rest.to_vec()));
    }

    let dictionary = Dictionary::from_tag(tag)
        .ok_or_else(|| CodecError::corrupt(format!("unknown tag 0x{tag:02x}")))?;

    if input.len() < HEADER_LEN {
        return Err(CodecError::corrupt("truncated length header"));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&input[1..HEADER_LEN]);
    let declared = u32::from_be_bytes(len_bytes) as usize;
    if declared > MAX_INFLATED_LEN {
        return Err(CodecError::corrupt(format!(
            "declared length {declared} exceeds limit"
        )));
    }

    let body = &input[HEADER_LEN..];
    // One spare byte so an over-long stream is detected instead of stalling.
    let mut out = Vec::with_capacity(declared + 1);
    let mut decoder = Decompress::new(true);
    let mut dictionary_set = false;

    loop {
        let before_in = decoder.total_in();
        let before_out = decoder.total_out();
        let consumed = stream_offset(before_in, body.len());

        match decoder.decompress_vec(&body[consumed..], &mut out, FlushDecompress::Finish) {
            Ok(Status::StreamEnd) => break,
            Ok(Status::Ok | Status::BufError) => {
                if out.len() > declared {
                    return Err(CodecError::corrupt("stream longer than declared length"));
                }
                if decoder.total_in() == before_in && decoder.total_out() == before_out {
                    return Err(CodecError::corrupt("stream ended before end marker"));
                }
            }
            Err(e) => match (e.needs_dictionary(), dictionary.bytes()) {
                (Some(_), Some(dict)) if !dictionary_set => {
                    decoder
                        .set_dictionary(dict)
                        .map_err(|e| CodecError::corrupt(format!("dictionary mismatch: {e}")))?;
                    dictionary_set = true;
                }
                (Some(_), _) => {
                    return Err(CodecError::corrupt(format!(
                        "stream requests a dictionary not available for tag '{}'",
                        char::from(tag)
                    )));
                }
                (None, _) => return Err(CodecError::corrupt(e.to_string())),
            },
        }
    }

    if out.len() != declared {
        return Err(CodecError::corrupt(format!(
            "decoded {} bytes, header declared {declared}",
            out.len()
        )));
    }

    Ok(Some(out))
}

/// Decode a text column, treating corrupt data as absent.
///
/// `field` names the column in the error log.
pub fn decompress_text(input: &[u8], field: &str) -> String {
    match decompress(input) {
        Ok(Some(bytes)) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                error!(field, error = %e, "decoded blob is not valid UTF-8");
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        },
        Ok(None) => String::new(),
        Err(e) => {
            error!(field, error = %e, "discarding corrupt blob");
            String::new()
        }
    }
}

// =============================================================================
// Id-set blobs
// =============================================================================

/// Pack ids as consecutive 8-byte big-endian integers.
pub fn encode_id_set<'a>(ids: impl IntoIterator<Item = &'a u64>) -> Vec<u8> {
    ids.into_iter().flat_map(|id| id.to_be_bytes()).collect()
}

/// Unpack an id-set blob. Trailing bytes short of a full id are ignored.
#[must_use]
pub fn decode_id_set(bytes: &[u8]) -> BTreeSet<u64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut id = [0u8; 8];
            id.copy_from_slice(chunk);
            u64::from_be_bytes(id)
        })
        .collect()
}

/// Pack and compress an id set for an account row.
///
/// # Errors
///
/// Propagates [`compress`] failures.
pub fn compress_id_set(ids: &BTreeSet<u64>) -> Result<CompressedBlob, CodecError> {
    compress(&encode_id_set(ids), Dictionary::None).map(CompressedBlob::blob_only)
}

/// Inverse of [`compress_id_set`]. Missing data yields an empty set.
///
/// # Errors
///
/// Returns [`CodecError::Corrupt`] if the blob cannot be decoded.
pub fn decompress_id_set(bytes: &[u8]) -> Result<BTreeSet<u64>, CodecError> {
    Ok(decompress(bytes)?
        .map(|raw| decode_id_set(&raw))
        .unwrap_or_default())
}

/// Upper bound on zlib output for `len` input bytes.
const fn deflate_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13 + 6
}

fn stream_offset(total: u64, limit: usize) -> usize {
    usize::try_from(total).map_or(limit, |n| n.min(limit))
}
