//! Constants and configuration for the IPset engine

/// Bits of the address consumed by one level of the radix tree.
pub const NUM_BITS: u32 = 4;
/// Child slots per radix node.
pub const NUM_CHILDREN: usize = 1 << NUM_BITS;
/// Mask to extract a child slot from an address shifted into place.
pub const CHILD_MASK: u128 = (NUM_CHILDREN as u128) - 1;

const _: () = assert!(NUM_CHILDREN <= 32, "child bitmaps are stored in a u32");
const _: () = assert!(32 % NUM_BITS == 0 && 128 % NUM_BITS == 0);

/// Deepest possible path from the root of an IPv6 tree.
pub const MAX_DEPTH: usize = 1 + (128 / NUM_BITS as usize);

/// Explicit DFS stacks hold at most every sibling along one path.
pub const DFS_STACK_SIZE: usize = NUM_CHILDREN * MAX_DEPTH;

// ---- arena growth ---------------------------------------------------------

pub const ARENA_INITIAL_ENTRIES: usize = 2_048;
pub const ARENA_DOUBLING_LIMIT: usize = 1_048_576;
pub const ARENA_LINEAR_STEP: usize = 1_048_576;

// ---- dense IPv4 bitmap ----------------------------------------------------

/// One top-level slot per IPv4 /16.
pub const DENSE_TOP_SLOTS: usize = 1 << 16;
/// 32-bit words needed to hold one bit per address of a /16.
pub const DENSE_BLOCK_WORDS: usize = (1 << 16) / 32;

// ---- v4-in-v6 mapping -----------------------------------------------------

/// `::ffff:0:0/96`
pub const V4_MAPPED_PREFIX: u128 = 0xffff_u128 << 32;
pub const V4_MAPPED_MASK: u128 = !0u128 << 32;
pub const V4_MAPPED_BITS: u32 = 96;

// ---- file header ----------------------------------------------------------

pub const HEADER_MAGIC: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];
pub const HEADER_START_LEN: usize = 16;
pub const FILE_VERSION: u8 = 16;
pub const FT_IPSET: u8 = 0x1D;
/// Version stamp written into headers: 3.19.2 encoded as in SiLK.
pub const WRITER_VERSION: u32 = 3_019_002;

pub const HENTRY_END_ID: u32 = 0;
pub const HENTRY_INVOCATION_ID: u32 = 2;
pub const HENTRY_ANNOTATION_ID: u32 = 3;
pub const HENTRY_IPSET_ID: u32 = 7;
pub const HENTRY_HEAD_LEN: usize = 8;
/// Entry head plus six u32 fields.
pub const HENTRY_IPSET_LEN: usize = HENTRY_HEAD_LEN + 6 * 4;

/// V3 payloads start on this boundary so a mapped view is aligned.
pub const RADIX_HEADER_ALIGN: usize = 8;

/// High bit of the header-entry `root_index` marks a leaf root.
pub const ROOT_IS_LEAF_FLAG: u32 = 0x8000_0000;

// ---- payload records ------------------------------------------------------

/// Marker for "a 256-bit bitmap follows".
pub const MARKER_BITMAP: u8 = 0x81;
/// Marker for "lower halves of this /64 follow" (SLASH64 only).
pub const MARKER_SLASH64: u8 = 0x82;
/// Bytes in the bitmap of one /24 or /120.
pub const CHUNK_BITMAP_BYTES: usize = 32;
pub const CHUNK_BITMAP_WORDS: usize = 8;
/// Addresses covered by one chunk bitmap.
pub const CHUNK_BITS: u32 = 8;

// ---- zlib block framing ---------------------------------------------------

pub const IOBUF_BLOCK_SIZE: usize = 1 << 16;
pub const IOBUF_MAX_COMPRESSED: usize = 1 << 24;

// ---- environment ----------------------------------------------------------

pub const ENV_RECORD_VERSION: &str = "SILK_IPSET_RECORD_VERSION";
pub const ENV_INCORE_FORMAT: &str = "SKIPSET_INCORE_FORMAT";
pub const ENV_DESTROY_PRINT: &str = "SKIPSET_DESTROY_PRINT";
pub const ENV_PRINT_READ_ERROR: &str = "SILK_IPSET_PRINT_READ_ERROR";
