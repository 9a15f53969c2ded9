/// Keys predefined for persistance:
/// Prefix used with the block key
pub const BLOCK_KEY_PREFIX: &str = "block";
/// Prefix used with the block RID to height index
pub const BLOCK_HEIGHT_KEY_PREFIX: &str = "block_height";
/// Key for storing the last committed block
pub const LAST_BLOCK_KEY: &str = "last_block";
